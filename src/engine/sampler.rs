//! Token sampling strategies.
//!
//! This module turns one row of logits into the next token of a sequence:
//!
//! - **Greedy**: arg-max of the processed logits, lowest token id on ties
//! - **Multinomial**: temperature, top-k and top-p (nucleus) sampling with a
//!   seedable random source
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Repetition penalty + no-repeat n-gram (both modes)
//! Processed logits ───────────────► argmax (greedy)
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering
//! Keep top k tokens (ties to the lower id)
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering
//! Smallest prefix with cumulative prob ≥ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::logits::{argmax, log_softmax, process_logits, row_to_vec, softmax};
use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::model::TokenId;

/// A chosen token with its log-probability under the distribution it was
/// chosen from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledToken {
    pub token: TokenId,
    pub log_prob: f32,
}

/// Token sampler driven by a [`GenerationConfig`].
#[derive(Debug, Clone)]
pub struct Sampler {
    config: GenerationConfig,
    /// Random number generator.
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from `config.rng_seed`, or from entropy.
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config: config.clone(),
            rng,
        }
    }

    /// Creates a sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &GenerationConfig, seed: u64) -> Self {
        Self {
            config: config.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample the next token of `history` from a logits tensor.
    ///
    /// Accepts `[vocab_size]` logits or `[n, vocab_size]`, in which case the
    /// last row is used.
    pub fn sample(
        &mut self,
        logits: &Tensor,
        history: &[TokenId],
    ) -> Result<Option<SampledToken>> {
        let row = match logits.dims() {
            [_] => 0,
            [n, _] if *n > 0 => n - 1,
            dims => {
                return Err(Error::Model(format!(
                    "expected 1D or 2D logits, got shape {dims:?}"
                )))
            }
        };
        self.select(row_to_vec(logits, row)?, history)
    }

    /// Choose the next token from one logits row.
    ///
    /// Returns `None` when processing leaves no token with a finite score,
    /// e.g. when the no-repeat n-gram rule bans the whole vocabulary.
    pub fn select(
        &mut self,
        mut logits: Vec<f32>,
        history: &[TokenId],
    ) -> Result<Option<SampledToken>> {
        if logits.is_empty() {
            return Err(Error::Model("empty logits row".to_string()));
        }
        process_logits(&mut logits, history, &self.config);

        if !logits.iter().any(|score| score.is_finite()) {
            tracing::trace!(history_len = history.len(), "no selectable token left");
            return Ok(None);
        }
        if self.config.do_sample {
            self.sample_multinomial(&logits)
        } else {
            self.greedy(&logits).map(Some)
        }
    }

    /// Greedy decoding: select the token with highest processed logit.
    fn greedy(&self, logits: &[f32]) -> Result<SampledToken> {
        let token = argmax(logits).ok_or_else(|| Error::Model("empty logits row".to_string()))?;
        let log_prob = log_softmax(logits)?[token as usize];
        Ok(SampledToken { token, log_prob })
    }

    /// Temperature, top-k, top-p, then a weighted draw.
    ///
    /// Returns `None` when no token has a finite score.
    fn sample_multinomial(&mut self, logits: &[f32]) -> Result<Option<SampledToken>> {
        let temperature = self.config.temperature;

        let mut candidates: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, score)| score.is_finite())
            .map(|(idx, &score)| (idx as TokenId, score / temperature))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        // Stable sort keeps the lower id first among equal scores.
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        candidates.truncate(self.config.top_k.max(1));

        let scores: Vec<f32> = candidates.iter().map(|&(_, score)| score).collect();
        let probs = softmax(&scores)?;
        let keep = nucleus_len(&probs, self.config.top_p);

        let kept = &probs[..keep];
        let total: f32 = kept.iter().sum();
        let dist = WeightedIndex::new(kept.iter().map(|&p| p / total))
            .map_err(|e| Error::Model(format!("failed to create distribution: {e}")))?;

        let idx = dist.sample(&mut self.rng);
        Ok(Some(SampledToken {
            token: candidates[idx].0,
            log_prob: (kept[idx] / total).ln(),
        }))
    }

    /// Get the configuration the sampler was built from.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }
}

/// Length of the smallest prefix of descending `probs` whose mass reaches `top_p`.
fn nucleus_len(probs: &[f32], top_p: f32) -> usize {
    if top_p >= 1.0 {
        return probs.len();
    }
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            return i + 1;
        }
    }
    probs.len()
}
