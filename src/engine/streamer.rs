//! Streaming gate.
//!
//! A [`Streamer`] is called synchronously on the decoding thread, once per
//! newly finalized token, and answers whether generation may continue.
//! Returning [`StreamingStatus::Stop`] is cooperative cancellation: the
//! current step finishes, running sequences are marked
//! [`FinishReason::CancelledByStreamer`](crate::core::FinishReason) and the
//! tokens produced so far are returned. EOS tokens are not streamed.
//!
//! ```text
//!  decode step ──► token ──► Streamer::write ──► Running ──► next step
//!                                   │
//!                                   └──────────► Stop ─────► finish, return
//! ```
//!
//! ## Example
//!
//! ```
//! use nano_genai::engine::{Streamer, StreamingStatus};
//!
//! let mut seen = Vec::new();
//! let mut streamer = |token: u32| {
//!     seen.push(token);
//!     if seen.len() == 3 { StreamingStatus::Stop } else { StreamingStatus::Running }
//! };
//! assert_eq!(streamer.write(7), StreamingStatus::Running);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::TokenId;
use crate::tokenizer::TextCodec;

/// Answer of a streamer after each token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingStatus {
    /// Keep generating.
    Running,
    /// Stop after the current step.
    Stop,
}

impl StreamingStatus {
    /// Whether generation should stop.
    pub fn is_stop(&self) -> bool {
        *self == Self::Stop
    }
}

/// Receives tokens as they are finalized.
pub trait Streamer {
    /// Handle one token.
    fn write(&mut self, token: TokenId) -> StreamingStatus;

    /// Called once when generation is over.
    fn end(&mut self) {}
}

impl<F> Streamer for F
where
    F: FnMut(TokenId) -> StreamingStatus,
{
    fn write(&mut self, token: TokenId) -> StreamingStatus {
        self(token)
    }
}

/// Read side of a stop request for a streamed generation.
///
/// Give it to a [`CancellableStreamer`]; the gate checks it before and after
/// forwarding every token.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    stop_requested: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token together with the [`CancellationHandle`] that trips it.
    pub fn new() -> (Self, CancellationHandle) {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let handle = CancellationHandle {
            stop_requested: Arc::clone(&stop_requested),
        };
        (Self { stop_requested }, handle)
    }

    /// Whether the gate should answer [`StreamingStatus::Stop`].
    pub fn is_cancelled(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Write side of a stop request; may live on any thread.
///
/// Tripping it never interrupts a model call. Generation ends at the next
/// token the gate sees.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    stop_requested: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Ask every gate sharing this request to stop.
    pub fn cancel(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Wraps a streamer so a [`CancellationHandle`] on another thread can stop it.
///
/// Cancellation is observed at the next token boundary.
pub struct CancellableStreamer<S> {
    inner: S,
    token: CancellationToken,
}

impl<S: Streamer> CancellableStreamer<S> {
    /// Wrap `inner`, stopping once `token` is cancelled.
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    /// Unwrap the inner streamer.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Streamer> Streamer for CancellableStreamer<S> {
    fn write(&mut self, token: TokenId) -> StreamingStatus {
        if self.token.is_cancelled() {
            return StreamingStatus::Stop;
        }
        let status = self.inner.write(token);
        if self.token.is_cancelled() {
            StreamingStatus::Stop
        } else {
            status
        }
    }

    fn end(&mut self) {
        self.inner.end();
    }
}

/// Detokenizes incrementally and forwards complete text to a callback.
///
/// Text whose decoding ends in U+FFFD is held back until the following
/// tokens complete the character; whatever remains is flushed on `end()`.
pub struct TextStreamer<C, F> {
    codec: C,
    callback: F,
    tokens: Vec<TokenId>,
    /// Bytes of decoded text already forwarded.
    printed_len: usize,
}

impl<C, F> TextStreamer<C, F>
where
    C: TextCodec,
    F: FnMut(&str) -> StreamingStatus,
{
    /// Create a streamer decoding with `codec`.
    pub fn new(codec: C, callback: F) -> Self {
        Self {
            codec,
            callback,
            tokens: Vec::new(),
            printed_len: 0,
        }
    }

    /// Tokens received so far.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Forward the undelivered tail of the decoded text.
    fn flush(&mut self, hold_incomplete: bool) -> StreamingStatus {
        let text = match self.codec.decode(&self.tokens) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode streamed tokens");
                return StreamingStatus::Running;
            }
        };
        if hold_incomplete && text.ends_with('\u{FFFD}') {
            return StreamingStatus::Running;
        }

        // Decoding may rewrite earlier text; resume at the next char boundary.
        let start = (self.printed_len..=text.len())
            .find(|&i| text.is_char_boundary(i))
            .unwrap_or(text.len());
        if start != self.printed_len {
            tracing::trace!(
                printed = self.printed_len,
                decoded = text.len(),
                "decoded text is not prefix-stable, resyncing"
            );
        }
        self.printed_len = text.len();

        let chunk = &text[start..];
        if chunk.is_empty() {
            StreamingStatus::Running
        } else {
            (self.callback)(chunk)
        }
    }
}

impl<C, F> Streamer for TextStreamer<C, F>
where
    C: TextCodec,
    F: FnMut(&str) -> StreamingStatus,
{
    fn write(&mut self, token: TokenId) -> StreamingStatus {
        self.tokens.push(token);
        self.flush(true)
    }

    fn end(&mut self) {
        self.flush(false);
        self.tokens.clear();
        self.printed_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    /// Byte-level codec: each token is one byte, invalid UTF-8 becomes U+FFFD.
    struct ByteCodec;

    impl TextCodec for ByteCodec {
        fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
            Ok(text.bytes().map(TokenId::from).collect())
        }

        fn decode(&self, tokens: &[TokenId]) -> Result<String> {
            let bytes: Vec<u8> = tokens.iter().map(|&t| t as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    #[test]
    fn test_closure_streamer() {
        let mut count = 0;
        let mut streamer = |_token: TokenId| {
            count += 1;
            StreamingStatus::Running
        };
        assert_eq!(streamer.write(1), StreamingStatus::Running);
        assert_eq!(streamer.write(2), StreamingStatus::Running);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cancellable_streamer() {
        let (token, handle) = CancellationToken::new();
        let mut streamer =
            CancellableStreamer::new(|_token: TokenId| StreamingStatus::Running, token);

        assert_eq!(streamer.write(1), StreamingStatus::Running);
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(streamer.write(2), StreamingStatus::Stop);
    }

    #[test]
    fn test_text_streamer_holds_incomplete_chars() {
        let mut chunks: Vec<String> = Vec::new();
        {
            let mut streamer = TextStreamer::new(ByteCodec, |chunk: &str| {
                chunks.push(chunk.to_string());
                StreamingStatus::Running
            });
            // "aé" is 0x61 0xC3 0xA9
            streamer.write(0x61);
            streamer.write(0xC3);
            streamer.write(0xA9);
            streamer.end();
        }
        assert_eq!(chunks, vec!["a".to_string(), "é".to_string()]);
    }

    /// Letters from token 1 up; token 0 erases the previous letter.
    struct EditingCodec;

    impl TextCodec for EditingCodec {
        fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
            Ok(text.bytes().map(|b| TokenId::from(b - b'a' + 1)).collect())
        }

        fn decode(&self, tokens: &[TokenId]) -> Result<String> {
            let mut text = String::new();
            for &t in tokens {
                if t == 0 {
                    text.pop();
                } else {
                    text.push(char::from(b'a' + t as u8 - 1));
                }
            }
            Ok(text)
        }
    }

    #[test]
    fn test_text_streamer_resyncs_after_rewrite() {
        let mut chunks: Vec<String> = Vec::new();
        {
            let mut streamer = TextStreamer::new(EditingCodec, |chunk: &str| {
                chunks.push(chunk.to_string());
                StreamingStatus::Running
            });
            // "b", "bc", "b", "bd", "bde"
            for token in [2, 3, 0, 4, 5] {
                streamer.write(token);
            }
            streamer.end();
        }
        assert_eq!(chunks, vec!["b", "c", "d", "e"]);
    }

    #[test]
    fn test_text_streamer_skips_split_char_after_rewrite() {
        let mut chunks: Vec<String> = Vec::new();
        {
            let mut streamer = TextStreamer::new(ByteCodec, |chunk: &str| {
                chunks.push(chunk.to_string());
                StreamingStatus::Running
            });
            streamer.printed_len = 2;
            // "aé" with two bytes already forwarded lands inside 'é'
            streamer.tokens = vec![0x61, 0xC3];
            assert_eq!(streamer.write(0xA9), StreamingStatus::Running);
            streamer.write(0x62);
        }
        assert_eq!(chunks, vec!["b"]);
    }

    #[test]
    fn test_text_streamer_flushes_on_end() {
        let mut chunks: Vec<String> = Vec::new();
        {
            let mut streamer = TextStreamer::new(ByteCodec, |chunk: &str| {
                chunks.push(chunk.to_string());
                StreamingStatus::Running
            });
            streamer.write(0xC3);
            streamer.end();
        }
        assert_eq!(chunks, vec!["\u{FFFD}".to_string()]);
    }
}
