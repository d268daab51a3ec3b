//! Integration tests for Sequence and SequenceGroup.

use nano_genai::core::{FinishReason, Sequence, SequenceGroup, SequenceStatus};
use nano_genai::{CacheHandle, GenerationConfig};

fn group(max_new_tokens: usize) -> SequenceGroup {
    let config = GenerationConfig {
        max_new_tokens: Some(max_new_tokens),
        ..Default::default()
    };
    SequenceGroup::new(7, vec![10, 20, 30], config, max_new_tokens)
}

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

    seq.append_token(100, -0.5);
    seq.append_token(101, -1.5);

    assert_eq!(seq.output_token_ids(), &[100, 101]);
    assert_eq!(seq.last_token_id(), Some(101));
    assert!((seq.cumulative_log_prob() + 2.0).abs() < 1e-6);
    assert_eq!(seq.history(&[1, 2]), vec![1, 2, 100, 101]);
}

#[test]
fn test_normalized_score() {
    let mut seq = Sequence::new(1);
    seq.append_token(1, -2.0);
    seq.append_token(2, -2.0);

    assert!((seq.normalized_score(1.0) + 2.0).abs() < 1e-6);
    assert!((seq.normalized_score(2.0) + 1.0).abs() < 1e-6);
}

#[test]
fn test_finish_keeps_first_reason() {
    let mut seq = Sequence::new(1);

    seq.set_finished(FinishReason::EndOfSequence, 3);
    seq.set_finished(FinishReason::MaxTokens, 5);

    assert!(seq.is_finished());
    assert_eq!(seq.finish_reason(), Some(FinishReason::EndOfSequence));
    assert_eq!(seq.finished_at(), Some(3));
}

#[test]
fn test_fork_does_not_share_cache() {
    let mut seq = Sequence::new(1);
    seq.append_token(5, -0.1);
    seq.set_cache(CacheHandle::new(3), 4);

    let child = seq.fork(2);

    assert_eq!(child.seq_id(), 2);
    assert_eq!(child.output_token_ids(), &[5]);
    assert_eq!(child.cache(), None);
    assert_eq!(child.num_cached_tokens(), 0);
}

#[test]
fn test_group_budget_and_history() {
    let mut group = group(3);
    assert_eq!(group.prompt_len(), 3);
    assert_eq!(group.remaining_budget(0), 3);

    group.sequence_mut(0).unwrap().append_token(40, -0.1);

    assert_eq!(group.remaining_budget(0), 2);
    assert_eq!(group.history(0), vec![10, 20, 30, 40]);
}

#[test]
fn test_group_fork_and_finish() {
    let mut group = group(4);
    let idx = group.fork_sequence(0).unwrap();

    assert_eq!(idx, 1);
    assert_eq!(group.num_running(), 2);
    assert_ne!(group.sequences()[0].seq_id(), group.sequences()[1].seq_id());

    group.finish_running(FinishReason::CancelledByStreamer, 2);
    assert!(group.is_finished());
    assert!(group.running_indices().is_empty());
}

#[test]
fn test_group_take_caches() {
    let mut group = group(4);
    group.sequence_mut(0).unwrap().set_cache(CacheHandle::new(1), 3);
    let idx = group.fork_sequence(0).unwrap();
    group.sequence_mut(idx).unwrap().set_cache(CacheHandle::new(2), 3);

    let mut caches = group.take_caches();
    caches.sort();

    assert_eq!(caches, vec![CacheHandle::new(1), CacheHandle::new(2)]);
    assert!(group.take_caches().is_empty());
}
