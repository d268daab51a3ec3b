//! Error types for nano-genai.

use thiserror::Error;

/// Result type alias for nano-genai operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-genai.
#[derive(Error, Debug)]
pub enum Error {
    /// Generation configuration rejected before any inference.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Chat session operation not allowed in the current state.
    #[error("invalid session state: cannot {operation} while {state}")]
    InvalidSessionState {
        state: &'static str,
        operation: &'static str,
    },

    /// Generation requested without any prompt tokens.
    #[error("empty prompt")]
    EmptyPrompt,

    /// Failure reported by the language model collaborator.
    #[error("model error: {0}")]
    Model(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a [`GenerationConfig`](crate::GenerationConfig) is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Parameters select incompatible decoding modes.
    #[error("conflicting decoding mode: {0}")]
    ConflictingMode(String),

    /// No finite token budget can be derived.
    #[error("missing token budget: {0}")]
    MissingBudget(String),

    /// A parameter is outside its allowed range or has the wrong type.
    #[error("invalid parameter: {0}")]
    InvalidRange(String),

    /// `max_length` leaves no room for new tokens after the prompt.
    #[error("max_length {max_length} does not exceed prompt length {prompt_length}")]
    BudgetUnderflow {
        max_length: usize,
        prompt_length: usize,
    },
}

impl Error {
    /// Returns the configuration error kind, if this is one.
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}
