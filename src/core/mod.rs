//! Core decoding state.
//!
//! This module contains the per-request building blocks:
//! - Sequence for one candidate continuation and its cache
//! - SequenceGroup for all candidates sharing a prompt

pub mod sequence;
pub mod sequence_group;

pub use sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
pub use sequence_group::{RequestId, SequenceGroup};
