//! Decoding engine.
//!
//! This module contains:
//! - [`LlmPipeline`] for driving a model through a generation request
//! - [`Sampler`] for greedy and multinomial token selection
//! - [`BeamSearcher`] for grouped diverse beam search
//! - [`Streamer`] implementations for token streaming and cancellation
//! - [`ChatSession`] for cross-turn cache reuse

pub mod beam_search;
pub mod chat;
pub mod logits;
pub mod pipeline;
pub mod sampler;
pub mod streamer;

pub use beam_search::{BeamGroup, BeamSearcher, GroupState};
pub use chat::{ChatSession, SessionState};
pub use pipeline::{DecodingStats, GeneratedSequence, GenerationOutput, LlmPipeline};
pub use sampler::{SampledToken, Sampler};
pub use streamer::{
    CancellableStreamer, CancellationHandle, CancellationToken, Streamer, StreamingStatus,
    TextStreamer,
};
