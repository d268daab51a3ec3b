//! Chat session state.
//!
//! ```text
//!          start_chat()                 finish_chat()
//!   Idle ───────────────► Active ────────────────────► Idle
//!    ▲ │                   │  ▲                          (cache dropped once)
//!    │ └ finish: no-op     └──┘ generate(): history += prompt + reply,
//!    │                          cache kept for the next turn
//!    └─ start while Active: InvalidSessionState
//! ```
//!
//! While a session is active, every turn decodes `history ++ new prompt`.
//! The cache retained from the previous turn holds all of the history except
//! its last token, so a turn only feeds what is new.

use crate::error::{Error, Result};
use crate::model::{CacheHandle, TokenId};

/// Whether a chat session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Active,
}

impl SessionState {
    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
        }
    }
}

/// Cross-turn history and cache of a chat.
#[derive(Debug)]
pub struct ChatSession {
    state: SessionState,
    history: Vec<TokenId>,
    cache: Option<CacheHandle>,
    /// History tokens held by `cache`.
    num_cached_tokens: usize,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    /// Create an idle session.
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            history: Vec::new(),
            cache: None,
            num_cached_tokens: 0,
        }
    }

    // ========== Getters ==========

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a session is open.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Tokens of all completed turns.
    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    /// Retained cache, if any.
    pub fn cache(&self) -> Option<CacheHandle> {
        self.cache
    }

    // ========== Transitions ==========

    /// Open a session.
    pub fn start(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(Error::InvalidSessionState {
                state: self.state.as_str(),
                operation: "start a chat",
            });
        }
        self.state = SessionState::Active;
        self.history.clear();
        self.cache = None;
        self.num_cached_tokens = 0;
        Ok(())
    }

    /// Close the session, handing back the cache to release.
    ///
    /// Returns `None` when idle, so a second call never yields the same
    /// handle again.
    pub fn finish(&mut self) -> Option<CacheHandle> {
        if !self.is_active() {
            return None;
        }
        self.state = SessionState::Idle;
        self.history.clear();
        self.num_cached_tokens = 0;
        self.cache.take()
    }

    /// Prompt for the next turn: history followed by `prompt`.
    pub fn turn_prompt(&self, prompt: &[TokenId]) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(self.history.len() + prompt.len());
        tokens.extend_from_slice(&self.history);
        tokens.extend_from_slice(prompt);
        tokens
    }

    /// Move the retained cache out for the current turn.
    pub fn take_cache(&mut self) -> Option<(CacheHandle, usize)> {
        let num_cached = std::mem::take(&mut self.num_cached_tokens);
        self.cache.take().map(|cache| (cache, num_cached))
    }

    /// Record a completed turn.
    ///
    /// `cache` holds the first `n` tokens of `history`, or is `None` when the
    /// next turn has to prefill from scratch.
    pub fn commit(&mut self, history: Vec<TokenId>, cache: Option<(CacheHandle, usize)>) {
        self.history = history;
        match cache {
            Some((cache, num_cached)) => {
                self.cache = Some(cache);
                self.num_cached_tokens = num_cached;
            }
            None => {
                self.cache = None;
                self.num_cached_tokens = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_twice_fails() {
        let mut session = ChatSession::new();
        session.start().unwrap();

        let err = session.start().unwrap_err();
        assert!(matches!(err, Error::InvalidSessionState { .. }));
        assert!(session.is_active());
    }

    #[test]
    fn test_finish_returns_cache_once() {
        let mut session = ChatSession::new();
        session.start().unwrap();
        session.commit(vec![1, 2, 3], Some((CacheHandle::new(4), 2)));

        assert_eq!(session.finish(), Some(CacheHandle::new(4)));
        assert_eq!(session.finish(), None);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.history().is_empty());
    }

    #[test]
    fn test_turn_prompt_appends_history() {
        let mut session = ChatSession::new();
        session.start().unwrap();
        session.commit(vec![1, 2], None);

        assert_eq!(session.turn_prompt(&[3]), vec![1, 2, 3]);
    }

    #[test]
    fn test_take_cache() {
        let mut session = ChatSession::new();
        session.start().unwrap();
        session.commit(vec![1, 2, 3], Some((CacheHandle::new(9), 2)));

        assert_eq!(session.take_cache(), Some((CacheHandle::new(9), 2)));
        assert_eq!(session.take_cache(), None);
        assert_eq!(session.finish(), None);
    }
}
