//! Language model collaborator.
//!
//! The decoding engine never computes logits itself. It talks to a causal
//! language model through [`LanguageModel`], which exposes incremental
//! inference over an opaque, request-scoped cache:
//!
//! ```text
//!   new_cache() ──► handle ──infer(tokens)──► logits [tokens, vocab] + handle'
//!                     │
//!                     ├──fork_cache──► independent copy (beam expansion)
//!                     ├──trim_cache──► drop rejected speculative tokens
//!                     └──drop_cache──► release (exactly once)
//! ```
//!
//! - [`ScriptedModel`]: deterministic in-memory model for tests and demos
//! - [`SharedModel`]: one model shared by requests on several threads

pub mod scripted;

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::Tensor;

use crate::error::{Error, Result};

pub use scripted::{ModelStats, ScriptedModel};

/// Token identifier.
pub type TokenId = u32;

/// Opaque handle to one sequence's incremental cache state.
///
/// Handles are request-scoped: a handle is never shared between two live
/// sequences, and each one is released with [`LanguageModel::drop_cache`]
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheHandle(u64);

impl CacheHandle {
    /// Wrap a raw identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw identifier.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A causal language model with an incremental cache.
pub trait LanguageModel {
    /// Allocate an empty cache.
    fn new_cache(&mut self) -> Result<CacheHandle>;

    /// Feed `tokens` on top of the cached history.
    ///
    /// Returns logits of shape `[tokens.len(), vocab_size]`: row `i` scores
    /// the token following `tokens[..=i]`. The returned handle replaces the
    /// one passed in.
    fn infer(&mut self, tokens: &[TokenId], cache: CacheHandle) -> Result<(Tensor, CacheHandle)>;

    /// Create an independent copy of a cache.
    fn fork_cache(&mut self, cache: CacheHandle) -> Result<CacheHandle>;

    /// Keep only the first `len` cached tokens.
    fn trim_cache(&mut self, cache: CacheHandle, len: usize) -> Result<()>;

    /// Release a cache.
    fn drop_cache(&mut self, cache: CacheHandle);
}

impl<M: LanguageModel + ?Sized> LanguageModel for &mut M {
    fn new_cache(&mut self) -> Result<CacheHandle> {
        (**self).new_cache()
    }

    fn infer(&mut self, tokens: &[TokenId], cache: CacheHandle) -> Result<(Tensor, CacheHandle)> {
        (**self).infer(tokens, cache)
    }

    fn fork_cache(&mut self, cache: CacheHandle) -> Result<CacheHandle> {
        (**self).fork_cache(cache)
    }

    fn trim_cache(&mut self, cache: CacheHandle, len: usize) -> Result<()> {
        (**self).trim_cache(cache, len)
    }

    fn drop_cache(&mut self, cache: CacheHandle) {
        (**self).drop_cache(cache)
    }
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn new_cache(&mut self) -> Result<CacheHandle> {
        (**self).new_cache()
    }

    fn infer(&mut self, tokens: &[TokenId], cache: CacheHandle) -> Result<(Tensor, CacheHandle)> {
        (**self).infer(tokens, cache)
    }

    fn fork_cache(&mut self, cache: CacheHandle) -> Result<CacheHandle> {
        (**self).fork_cache(cache)
    }

    fn trim_cache(&mut self, cache: CacheHandle, len: usize) -> Result<()> {
        (**self).trim_cache(cache, len)
    }

    fn drop_cache(&mut self, cache: CacheHandle) {
        (**self).drop_cache(cache)
    }
}

/// A model shared between independent requests.
///
/// Every call takes the lock for its own duration only, so requests running
/// on different threads interleave at call granularity. Their cache handles
/// stay disjoint.
pub struct SharedModel<M> {
    inner: Arc<Mutex<M>>,
}

impl<M> SharedModel<M> {
    /// Wrap a model for sharing.
    pub fn new(model: M) -> Self {
        Self {
            inner: Arc::new(Mutex::new(model)),
        }
    }

    /// Run `f` with exclusive access to the underlying model.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut M) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    fn lock(&self) -> Result<MutexGuard<'_, M>> {
        self.inner
            .lock()
            .map_err(|_| Error::Model("shared model lock poisoned".to_string()))
    }
}

impl<M> Clone for SharedModel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: LanguageModel> LanguageModel for SharedModel<M> {
    fn new_cache(&mut self) -> Result<CacheHandle> {
        self.lock()?.new_cache()
    }

    fn infer(&mut self, tokens: &[TokenId], cache: CacheHandle) -> Result<(Tensor, CacheHandle)> {
        self.lock()?.infer(tokens, cache)
    }

    fn fork_cache(&mut self, cache: CacheHandle) -> Result<CacheHandle> {
        self.lock()?.fork_cache(cache)
    }

    fn trim_cache(&mut self, cache: CacheHandle, len: usize) -> Result<()> {
        self.lock()?.trim_cache(cache, len)
    }

    fn drop_cache(&mut self, cache: CacheHandle) {
        match self.inner.lock() {
            Ok(mut model) => model.drop_cache(cache),
            Err(_) => tracing::warn!(cache = cache.id(), "shared model lock poisoned, cache leaked"),
        }
    }
}
