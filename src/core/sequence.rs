//! Sequence tracking for decoding.
//!
//! A sequence is one candidate continuation of a prompt: its generated
//! tokens, cumulative log-probability, finish state, and the model cache that
//! holds its history. Ancestry is kept as an append-only token log, so forking
//! a sequence copies the log instead of pointing back at the parent.

use crate::model::{CacheHandle, TokenId};

/// Unique identifier for a sequence within its group.
pub type SequenceId = u64;

/// Status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Still generating.
    Running,
    /// Finished generation.
    Finished,
}

impl SequenceStatus {
    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Token budget exhausted.
    MaxTokens,
    /// The streamer asked generation to stop.
    CancelledByStreamer,
    /// Every token was excluded, e.g. by the no-repeat n-gram rule.
    VocabularyExhausted,
}

/// A single candidate continuation.
///
/// # Example
///
/// ```
/// use nano_genai::core::sequence::{Sequence, SequenceStatus, FinishReason};
///
/// let mut seq = Sequence::new(0);
/// seq.append_token(5, -0.5);
/// seq.append_token(9, -1.0);
/// assert_eq!(seq.output_token_ids(), &[5, 9]);
/// assert_eq!(seq.cumulative_log_prob(), -1.5);
///
/// seq.set_finished(FinishReason::MaxTokens, 2);
/// assert_eq!(seq.status(), SequenceStatus::Finished);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    output_token_ids: Vec<TokenId>,
    cumulative_log_prob: f32,
    status: SequenceStatus,
    finish_reason: Option<FinishReason>,
    /// Decoding step at which the sequence finished.
    finished_at: Option<usize>,
    /// Model cache holding this sequence's history.
    cache: Option<CacheHandle>,
    /// Number of history tokens (prompt + output) present in `cache`.
    num_cached_tokens: usize,
    /// Beam group this sequence belongs to (beam search only).
    beam_group: Option<usize>,
}

impl Sequence {
    /// Create an empty running sequence.
    pub fn new(seq_id: SequenceId) -> Self {
        Self {
            seq_id,
            output_token_ids: Vec::new(),
            cumulative_log_prob: 0.0,
            status: SequenceStatus::Running,
            finish_reason: None,
            finished_at: None,
            cache: None,
            num_cached_tokens: 0,
            beam_group: None,
        }
    }

    /// Create a copy under a new ID that owns no cache.
    pub fn fork(&self, seq_id: SequenceId) -> Self {
        Self {
            seq_id,
            output_token_ids: self.output_token_ids.clone(),
            cumulative_log_prob: self.cumulative_log_prob,
            status: self.status,
            finish_reason: self.finish_reason,
            finished_at: self.finished_at,
            cache: None,
            num_cached_tokens: 0,
            beam_group: self.beam_group,
        }
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the generated token IDs.
    pub fn output_token_ids(&self) -> &[TokenId] {
        &self.output_token_ids
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the last generated token.
    pub fn last_token_id(&self) -> Option<TokenId> {
        self.output_token_ids.last().copied()
    }

    /// Get the cumulative log-probability.
    pub fn cumulative_log_prob(&self) -> f32 {
        self.cumulative_log_prob
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Get the decoding step at which the sequence finished.
    pub fn finished_at(&self) -> Option<usize> {
        self.finished_at
    }

    /// Get the beam group index.
    pub fn beam_group(&self) -> Option<usize> {
        self.beam_group
    }

    /// Get the cache handle.
    pub fn cache(&self) -> Option<CacheHandle> {
        self.cache
    }

    /// Get the number of history tokens already in the cache.
    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    /// Full history: `prompt` followed by the generated tokens.
    pub fn history(&self, prompt: &[TokenId]) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(prompt.len() + self.output_len());
        tokens.extend_from_slice(prompt);
        tokens.extend_from_slice(&self.output_token_ids);
        tokens
    }

    /// Length-normalized score: `cumulative_log_prob / len^length_penalty`.
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        let len = self.output_len().max(1) as f32;
        self.cumulative_log_prob / len.powf(length_penalty)
    }

    // ========== Mutation ==========

    /// Append a generated token with its log-probability.
    pub fn append_token(&mut self, token_id: TokenId, log_prob: f32) {
        self.output_token_ids.push(token_id);
        self.cumulative_log_prob += log_prob;
    }

    /// Attach a cache that holds `num_cached_tokens` history tokens.
    pub fn set_cache(&mut self, cache: CacheHandle, num_cached_tokens: usize) {
        self.cache = Some(cache);
        self.num_cached_tokens = num_cached_tokens;
    }

    /// Update the number of cached history tokens.
    pub fn set_num_cached_tokens(&mut self, num_cached_tokens: usize) {
        self.num_cached_tokens = num_cached_tokens;
    }

    /// Detach the cache, leaving the sequence without one.
    pub fn take_cache(&mut self) -> Option<CacheHandle> {
        self.num_cached_tokens = 0;
        self.cache.take()
    }

    /// Assign the sequence to a beam group.
    pub fn set_beam_group(&mut self, group: usize) {
        self.beam_group = Some(group);
    }

    /// Mark the sequence as finished at decoding step `step`.
    ///
    /// Finishing twice keeps the first reason.
    pub fn set_finished(&mut self, reason: FinishReason, step: usize) {
        if self.is_finished() {
            return;
        }
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
        self.finished_at = Some(step);
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_creation() {
        let seq = Sequence::new(1);

        assert_eq!(seq.seq_id(), 1);
        assert_eq!(seq.output_len(), 0);
        assert_eq!(seq.status(), SequenceStatus::Running);
        assert_eq!(seq.finish_reason(), None);
        assert_eq!(seq.cache(), None);
    }

    #[test]
    fn test_append_tokens() {
        let mut seq = Sequence::new(1);

        seq.append_token(100, -0.25);
        seq.append_token(101, -0.75);

        assert_eq!(seq.output_token_ids(), &[100, 101]);
        assert_eq!(seq.last_token_id(), Some(101));
        assert_eq!(seq.cumulative_log_prob(), -1.0);
    }

    #[test]
    fn test_history() {
        let mut seq = Sequence::new(1);
        seq.append_token(10, 0.0);
        seq.append_token(20, 0.0);

        assert_eq!(seq.history(&[1, 2, 3]), vec![1, 2, 3, 10, 20]);
    }

    #[test]
    fn test_fork_copies_tokens_not_cache() {
        let mut seq = Sequence::new(1);
        seq.append_token(7, -1.0);
        seq.set_cache(CacheHandle::new(3), 4);

        let child = seq.fork(2);

        assert_eq!(child.seq_id(), 2);
        assert_eq!(child.output_token_ids(), &[7]);
        assert_eq!(child.cumulative_log_prob(), -1.0);
        assert_eq!(child.cache(), None);
        assert_eq!(seq.cache(), Some(CacheHandle::new(3)));
    }

    #[test]
    fn test_finish_keeps_first_reason() {
        let mut seq = Sequence::new(1);

        seq.set_finished(FinishReason::EndOfSequence, 3);
        seq.set_finished(FinishReason::CancelledByStreamer, 4);

        assert!(seq.is_finished());
        assert_eq!(seq.finish_reason(), Some(FinishReason::EndOfSequence));
        assert_eq!(seq.finished_at(), Some(3));
    }

    #[test]
    fn test_normalized_score() {
        let mut seq = Sequence::new(1);
        seq.append_token(1, -2.0);
        seq.append_token(2, -2.0);

        assert_eq!(seq.normalized_score(1.0), -2.0);
        assert_eq!(seq.normalized_score(0.0), -4.0);
    }

    #[test]
    fn test_take_cache() {
        let mut seq = Sequence::new(1);
        seq.set_cache(CacheHandle::new(9), 5);

        assert_eq!(seq.take_cache(), Some(CacheHandle::new(9)));
        assert_eq!(seq.take_cache(), None);
        assert_eq!(seq.num_cached_tokens(), 0);
    }
}
