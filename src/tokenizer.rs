//! Tokenization collaborator.
//!
//! Encoding and decoding are pure functions outside the decoding core. The
//! engine only needs them for the text-level entry points and for
//! [`TextStreamer`](crate::engine::TextStreamer).

use std::ops::Deref;

use crate::error::{Error, Result};
use crate::model::TokenId;

/// Converts between text and token IDs.
pub trait TextCodec {
    /// Encode text into token IDs.
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Decode token IDs into text, skipping special tokens.
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;
}

impl TextCodec for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = Deref::deref(self)
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        Deref::deref(self)
            .decode(tokens, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }
}

impl<T: TextCodec + ?Sized> TextCodec for &T {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        (**self).encode(text)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        (**self).decode(tokens)
    }
}

/// Load a Hugging Face `tokenizer.json`.
pub fn load_tokenizer(path: impl AsRef<std::path::Path>) -> Result<tokenizers::Tokenizer> {
    tokenizers::Tokenizer::from_file(path).map_err(|e| Error::Tokenization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": { "hello": 0, "world": 1, "[UNK]": 2 },
            "unk_token": "[UNK]"
        }
    }"#;

    fn word_level() -> tokenizers::Tokenizer {
        tokenizers::Tokenizer::from_str(WORD_LEVEL_JSON).unwrap()
    }

    #[test]
    fn test_tokenizer_codec_encode() {
        let tokenizer = word_level();
        let ids = TextCodec::encode(&tokenizer, "hello world hello").unwrap();
        assert_eq!(ids, vec![0, 1, 0]);

        let unknown = TextCodec::encode(&tokenizer, "goodbye").unwrap();
        assert_eq!(unknown, vec![2]);
    }

    #[test]
    fn test_tokenizer_codec_decode() {
        let tokenizer = word_level();
        let text = TextCodec::decode(&tokenizer, &[1, 0]).unwrap();
        assert_eq!(text, "world hello");
    }

    #[test]
    fn test_codec_through_reference() {
        let tokenizer = word_level();
        let codec: &dyn TextCodec = &tokenizer;
        assert_eq!(TextCodec::encode(&codec, "world").unwrap(), vec![1]);
    }

    #[test]
    fn test_load_tokenizer_missing_file() {
        let err = load_tokenizer("/nonexistent/tokenizer.json").unwrap_err();
        assert!(matches!(err, Error::Tokenization(_)));
    }
}
