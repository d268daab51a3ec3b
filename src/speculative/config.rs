//! Acceleration configuration.

use serde::{Deserialize, Serialize};

use crate::config::ConfigResult;
use crate::error::ConfigError;

/// Configuration for speculative and prompt-lookup decoding.
///
/// Both proposal sources offer at most K tokens per step; the target model
/// then verifies K+1 positions in a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Number of tokens to propose per step (K).
    /// Higher values can improve throughput if acceptance rate is high,
    /// but waste computation if many tokens are rejected.
    pub num_speculative_tokens: usize,

    /// Longest history suffix matched by prompt lookup.
    pub max_ngram_size: usize,

    /// Shortest history suffix matched by prompt lookup.
    pub min_ngram_size: usize,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 5,
            max_ngram_size: 3,
            min_ngram_size: 1,
        }
    }
}

impl SpeculativeConfig {
    /// Create a config proposing `k` tokens per step.
    pub fn new(k: usize) -> Self {
        Self {
            num_speculative_tokens: k,
            ..Default::default()
        }
    }

    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Set the n-gram sizes tried by prompt lookup.
    pub fn ngram_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_ngram_size = min;
        self.max_ngram_size = max;
        self
    }

    /// Check the parameters.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.num_speculative_tokens == 0 {
            return Err(ConfigError::InvalidRange(
                "'num_speculative_tokens' must be greater than 0".to_string(),
            ));
        }
        if self.min_ngram_size == 0 {
            return Err(ConfigError::InvalidRange(
                "'min_ngram_size' must be greater than 0".to_string(),
            ));
        }
        if self.min_ngram_size > self.max_ngram_size {
            return Err(ConfigError::InvalidRange(format!(
                "'min_ngram_size' ({}) cannot exceed 'max_ngram_size' ({})",
                self.min_ngram_size, self.max_ngram_size
            )));
        }
        Ok(())
    }
}
