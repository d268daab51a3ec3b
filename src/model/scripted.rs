//! Deterministic in-memory language model.
//!
//! [`ScriptedModel`] computes logits as a pure function of the full token
//! history held in each cache, so every decoding path (one token at a time,
//! batched verification, forked beams) sees exactly the same scores for the
//! same prefix. It also counts calls and cache operations, and can be told to
//! fail, which makes it the backbone of the engine tests.
//!
//! ## Example
//!
//! ```
//! use nano_genai::model::{LanguageModel, ScriptedModel};
//!
//! // Always prefer the token after the last one.
//! let mut model = ScriptedModel::new(8, |history| {
//!     let next = (history.last().copied().unwrap_or(0) + 1) % 8;
//!     (0..8).map(|t| if t == next { 1.0 } else { 0.0 }).collect()
//! });
//!
//! let cache = model.new_cache().unwrap();
//! let (logits, cache) = model.infer(&[3, 4], cache).unwrap();
//! assert_eq!(logits.dims(), &[2, 8]);
//! model.drop_cache(cache);
//! assert_eq!(model.live_caches(), 0);
//! ```

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use super::{CacheHandle, LanguageModel, TokenId};
use crate::error::{Error, Result};

type LogitsFn = Box<dyn Fn(&[TokenId]) -> Vec<f32> + Send + Sync>;

/// Call and cache counters of a [`ScriptedModel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelStats {
    /// Number of `infer` calls, including failed ones.
    pub infer_calls: usize,
    /// Number of tokens fed through `infer`.
    pub tokens_processed: usize,
    /// Number of caches created with `new_cache`.
    pub caches_created: usize,
    /// Number of successful forks.
    pub forks: usize,
    /// Number of caches released.
    pub drops: usize,
    /// Number of `drop_cache` calls on unknown or already released handles.
    pub invalid_drops: usize,
}

/// Language model whose logits are a function of the token history.
pub struct ScriptedModel {
    vocab_size: usize,
    logits_fn: LogitsFn,
    caches: HashMap<CacheHandle, Vec<TokenId>>,
    next_handle: u64,
    stats: ModelStats,
    fail_at_call: Option<usize>,
}

impl ScriptedModel {
    /// Create a model from a logits function over the full history.
    pub fn new<F>(vocab_size: usize, logits_fn: F) -> Self
    where
        F: Fn(&[TokenId]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            vocab_size,
            logits_fn: Box::new(logits_fn),
            caches: HashMap::new(),
            next_handle: 1,
            stats: ModelStats::default(),
            fail_at_call: None,
        }
    }

    /// Model with pseudo-random but reproducible logits in `[-4, 4)`.
    pub fn hashed(vocab_size: usize, seed: u64) -> Self {
        Self::new(vocab_size, move |history| hashed_logits(history, vocab_size, seed))
    }

    /// Make the `call`-th `infer` call (1-based) fail.
    pub fn fail_at_call(mut self, call: usize) -> Self {
        self.fail_at_call = Some(call);
        self
    }

    /// Get the vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Get the call and cache counters.
    pub fn stats(&self) -> ModelStats {
        self.stats
    }

    /// Number of caches currently allocated.
    pub fn live_caches(&self) -> usize {
        self.caches.len()
    }

    /// Tokens held by a cache.
    pub fn cached_tokens(&self, cache: CacheHandle) -> Option<&[TokenId]> {
        self.caches.get(&cache).map(Vec::as_slice)
    }

    fn allocate(&mut self, tokens: Vec<TokenId>) -> CacheHandle {
        let handle = CacheHandle::new(self.next_handle);
        self.next_handle += 1;
        self.caches.insert(handle, tokens);
        handle
    }
}

impl LanguageModel for ScriptedModel {
    fn new_cache(&mut self) -> Result<CacheHandle> {
        self.stats.caches_created += 1;
        Ok(self.allocate(Vec::new()))
    }

    fn infer(&mut self, tokens: &[TokenId], cache: CacheHandle) -> Result<(Tensor, CacheHandle)> {
        self.stats.infer_calls += 1;
        if self.fail_at_call == Some(self.stats.infer_calls) {
            return Err(Error::Model(format!(
                "injected failure at call {}",
                self.stats.infer_calls
            )));
        }
        if tokens.is_empty() {
            return Err(Error::Model("infer called without input tokens".to_string()));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(Error::Model(format!(
                "token {bad} outside vocabulary of {}",
                self.vocab_size
            )));
        }

        let vocab_size = self.vocab_size;
        let history = self
            .caches
            .get_mut(&cache)
            .ok_or_else(|| Error::Model(format!("unknown cache handle {}", cache.id())))?;

        let mut flat = Vec::with_capacity(tokens.len() * vocab_size);
        for &token in tokens {
            history.push(token);
            let row = (self.logits_fn)(history);
            if row.len() != vocab_size {
                return Err(Error::Model(format!(
                    "logits row has {} entries, expected {vocab_size}",
                    row.len()
                )));
            }
            flat.extend(row);
        }
        self.stats.tokens_processed += tokens.len();

        let logits = Tensor::from_vec(flat, (tokens.len(), vocab_size), &Device::Cpu)?;
        Ok((logits, cache))
    }

    fn fork_cache(&mut self, cache: CacheHandle) -> Result<CacheHandle> {
        let tokens = self
            .caches
            .get(&cache)
            .cloned()
            .ok_or_else(|| Error::Model(format!("cannot fork unknown cache {}", cache.id())))?;
        self.stats.forks += 1;
        Ok(self.allocate(tokens))
    }

    fn trim_cache(&mut self, cache: CacheHandle, len: usize) -> Result<()> {
        let history = self
            .caches
            .get_mut(&cache)
            .ok_or_else(|| Error::Model(format!("cannot trim unknown cache {}", cache.id())))?;
        if len > history.len() {
            return Err(Error::Model(format!(
                "cannot trim cache of {} tokens to {len}",
                history.len()
            )));
        }
        history.truncate(len);
        Ok(())
    }

    fn drop_cache(&mut self, cache: CacheHandle) {
        if self.caches.remove(&cache).is_some() {
            self.stats.drops += 1;
        } else {
            self.stats.invalid_drops += 1;
        }
    }
}

/// FNV-1a over the history followed by an xorshift stream per vocabulary entry.
fn hashed_logits(history: &[TokenId], vocab_size: usize, seed: u64) -> Vec<f32> {
    let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ seed;
    for &token in history {
        for byte in token.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    let mut state = hash | 1;
    (0..vocab_size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // 24 random bits mapped onto [-4, 4)
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 8.0 - 4.0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_returns_row_per_token() {
        let mut model = ScriptedModel::hashed(16, 7);
        let cache = model.new_cache().unwrap();
        let (logits, cache) = model.infer(&[1, 2, 3], cache).unwrap();

        assert_eq!(logits.dims(), &[3, 16]);
        assert_eq!(model.cached_tokens(cache), Some(&[1, 2, 3][..]));
        assert_eq!(model.stats().infer_calls, 1);
        assert_eq!(model.stats().tokens_processed, 3);
    }

    #[test]
    fn test_batched_and_incremental_rows_match() {
        let mut model = ScriptedModel::hashed(16, 7);

        let a = model.new_cache().unwrap();
        let (batched, _) = model.infer(&[4, 5, 6], a).unwrap();

        let b = model.new_cache().unwrap();
        let (_, b) = model.infer(&[4, 5], b).unwrap();
        let (single, _) = model.infer(&[6], b).unwrap();

        let batched: Vec<Vec<f32>> = batched.to_vec2().unwrap();
        let single: Vec<Vec<f32>> = single.to_vec2().unwrap();
        assert_eq!(batched[2], single[0]);
    }

    #[test]
    fn test_fork_and_trim() {
        let mut model = ScriptedModel::hashed(8, 0);
        let cache = model.new_cache().unwrap();
        let (_, cache) = model.infer(&[1, 2, 3], cache).unwrap();

        let fork = model.fork_cache(cache).unwrap();
        model.trim_cache(fork, 1).unwrap();

        assert_eq!(model.cached_tokens(cache), Some(&[1, 2, 3][..]));
        assert_eq!(model.cached_tokens(fork), Some(&[1][..]));
        assert!(model.trim_cache(fork, 5).is_err());
    }

    #[test]
    fn test_double_drop_is_counted() {
        let mut model = ScriptedModel::hashed(8, 0);
        let cache = model.new_cache().unwrap();

        model.drop_cache(cache);
        model.drop_cache(cache);

        assert_eq!(model.stats().drops, 1);
        assert_eq!(model.stats().invalid_drops, 1);
        assert_eq!(model.live_caches(), 0);
    }

    #[test]
    fn test_injected_failure() {
        let mut model = ScriptedModel::hashed(8, 0).fail_at_call(2);
        let cache = model.new_cache().unwrap();
        let (_, cache) = model.infer(&[1], cache).unwrap();

        assert!(matches!(model.infer(&[2], cache), Err(Error::Model(_))));
    }

    #[test]
    fn test_out_of_vocab_rejected() {
        let mut model = ScriptedModel::hashed(8, 0);
        let cache = model.new_cache().unwrap();
        assert!(model.infer(&[8], cache).is_err());
    }
}
