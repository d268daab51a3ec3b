//! Per-request decoding state.
//!
//! A [`SequenceGroup`] owns everything one `generate` call mutates: the
//! prompt, the candidate sequences that share it, the resolved configuration
//! and the token budget. Nothing in a group is shared with another request,
//! so independent groups can run on separate threads.

use crate::config::GenerationConfig;
use crate::model::{CacheHandle, TokenId};

use super::sequence::{FinishReason, Sequence, SequenceId};

/// Identifier of a generation request.
pub type RequestId = u64;

/// Candidate sequences sharing one prompt.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    request_id: RequestId,
    prompt_token_ids: Vec<TokenId>,
    sequences: Vec<Sequence>,
    config: GenerationConfig,
    /// Resolved token budget for every sequence.
    max_new_tokens: usize,
    next_seq_id: SequenceId,
}

impl SequenceGroup {
    /// Create a group with a single seed sequence.
    pub fn new(
        request_id: RequestId,
        prompt_token_ids: Vec<TokenId>,
        config: GenerationConfig,
        max_new_tokens: usize,
    ) -> Self {
        Self {
            request_id,
            prompt_token_ids,
            sequences: vec![Sequence::new(0)],
            config,
            max_new_tokens,
            next_seq_id: 1,
        }
    }

    // ========== Getters ==========

    /// Get the request ID.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[TokenId] {
        &self.prompt_token_ids
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the configuration this group decodes with.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Get the token budget.
    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Get all sequences.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Get a sequence by position.
    pub fn sequence(&self, index: usize) -> Option<&Sequence> {
        self.sequences.get(index)
    }

    /// Get a mutable sequence by position.
    pub fn sequence_mut(&mut self, index: usize) -> Option<&mut Sequence> {
        self.sequences.get_mut(index)
    }

    /// Positions of the sequences that are still running.
    pub fn running_indices(&self) -> Vec<usize> {
        self.sequences
            .iter()
            .enumerate()
            .filter(|(_, seq)| !seq.is_finished())
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of running sequences.
    pub fn num_running(&self) -> usize {
        self.sequences.iter().filter(|seq| !seq.is_finished()).count()
    }

    /// Whether every sequence has finished.
    pub fn is_finished(&self) -> bool {
        self.sequences.iter().all(Sequence::is_finished)
    }

    /// Prompt followed by the tokens of sequence `index`.
    pub fn history(&self, index: usize) -> Vec<TokenId> {
        self.sequences
            .get(index)
            .map(|seq| seq.history(&self.prompt_token_ids))
            .unwrap_or_else(|| self.prompt_token_ids.clone())
    }

    /// Tokens sequence `index` may still generate.
    pub fn remaining_budget(&self, index: usize) -> usize {
        let used = self.sequences.get(index).map_or(0, Sequence::output_len);
        self.max_new_tokens.saturating_sub(used)
    }

    // ========== Mutation ==========

    /// Add a copy of sequence `index` without a cache and return its position.
    pub fn fork_sequence(&mut self, index: usize) -> Option<usize> {
        let child = self.sequences.get(index)?.fork(self.next_seq_id);
        self.next_seq_id += 1;
        self.sequences.push(child);
        Some(self.sequences.len() - 1)
    }

    /// Finish every running sequence with `reason`.
    pub fn finish_running(&mut self, reason: FinishReason, step: usize) {
        for seq in self.sequences.iter_mut().filter(|seq| !seq.is_finished()) {
            seq.set_finished(reason, step);
        }
    }

    /// Detach every cache owned by the group's sequences.
    pub fn take_caches(&mut self) -> Vec<CacheHandle> {
        self.sequences
            .iter_mut()
            .filter_map(Sequence::take_cache)
            .collect()
    }

    /// Consume the group, returning its sequences.
    pub fn into_sequences(self) -> Vec<Sequence> {
        self.sequences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> SequenceGroup {
        let config = GenerationConfig {
            max_new_tokens: Some(4),
            ..Default::default()
        };
        SequenceGroup::new(7, vec![1, 2, 3], config, 4)
    }

    #[test]
    fn test_new_group_has_seed_sequence() {
        let group = group();

        assert_eq!(group.request_id(), 7);
        assert_eq!(group.prompt_len(), 3);
        assert_eq!(group.sequences().len(), 1);
        assert_eq!(group.num_running(), 1);
        assert!(!group.is_finished());
    }

    #[test]
    fn test_fork_and_budget() {
        let mut group = group();
        group.sequence_mut(0).unwrap().append_token(9, -0.1);

        let child = group.fork_sequence(0).unwrap();
        group.sequence_mut(child).unwrap().append_token(5, -0.2);

        assert_eq!(group.history(0), vec![1, 2, 3, 9]);
        assert_eq!(group.history(child), vec![1, 2, 3, 9, 5]);
        assert_eq!(group.remaining_budget(0), 3);
        assert_eq!(group.remaining_budget(child), 2);
        assert_ne!(group.sequences()[0].seq_id(), group.sequences()[child].seq_id());
    }

    #[test]
    fn test_finish_running() {
        let mut group = group();
        group.fork_sequence(0);
        group
            .sequence_mut(0)
            .unwrap()
            .set_finished(FinishReason::EndOfSequence, 1);

        group.finish_running(FinishReason::CancelledByStreamer, 2);

        assert!(group.is_finished());
        assert_eq!(
            group.sequences()[0].finish_reason(),
            Some(FinishReason::EndOfSequence)
        );
        assert_eq!(
            group.sequences()[1].finish_reason(),
            Some(FinishReason::CancelledByStreamer)
        );
    }

    #[test]
    fn test_take_caches() {
        let mut group = group();
        let child = group.fork_sequence(0).unwrap();
        group.sequence_mut(0).unwrap().set_cache(CacheHandle::new(1), 3);
        group.sequence_mut(child).unwrap().set_cache(CacheHandle::new(2), 3);

        let mut caches = group.take_caches();
        caches.sort();

        assert_eq!(caches, vec![CacheHandle::new(1), CacheHandle::new(2)]);
        assert!(group.take_caches().is_empty());
    }
}
