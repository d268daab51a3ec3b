//! nano-genai: a minimalistic text-generation decoding engine in Rust.
//!
//! This crate turns a causal language model into a text generator:
//! - Greedy decoding
//! - Grouped diverse beam search with length penalty and stop criteria
//! - Multinomial sampling with temperature, top-k and top-p
//! - Speculative decoding with a draft model or prompt lookup
//! - Chat sessions that keep the model cache between turns
//! - Streaming with cooperative cancellation
//!
//! The model itself stays behind the [`LanguageModel`] trait; the engine owns
//! only decoding policy and cache bookkeeping.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod model;
pub mod speculative;
pub mod tokenizer;

pub use config::{ConfigOverrides, DecodingMode, GenerationConfig, StopCriteria};
pub use crate::core::{FinishReason, Sequence, SequenceGroup, SequenceStatus};
pub use engine::{
    BeamSearcher, CancellableStreamer, CancellationHandle, CancellationToken, DecodingStats,
    GeneratedSequence, GenerationOutput, LlmPipeline, Sampler, Streamer, StreamingStatus,
    TextStreamer,
};
pub use error::{ConfigError, Error, Result};
pub use model::{CacheHandle, LanguageModel, ScriptedModel, SharedModel, TokenId};
pub use speculative::{ProposalSource, SpeculativeConfig};
pub use tokenizer::{load_tokenizer, TextCodec};
