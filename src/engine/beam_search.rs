//! Grouped diverse beam search.
//!
//! `num_beams` beams are split into `num_beam_groups` groups of equal size.
//! Every decoding step walks the groups in order, and each group runs its own
//! small state machine:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!       Expanding ──► Scoring ──► Pruning ──► stop rule? ─no┘
//!   (logits per beam) (log-probs,  (keep the best      │
//!                      diversity)   group_size)        yes
//!                                                      ▼
//!                                                 Terminated
//! ```
//!
//! - **Expanding**: each live beam feeds its last token to the model.
//! - **Scoring**: logits are processed (repetition penalty, no-repeat
//!   n-gram), turned into log-probabilities, and every token already chosen
//!   by an earlier group at this step costs `diversity_penalty` per
//!   occurrence. Each beam offers its `2 * group_size` best tokens.
//! - **Pruning**: candidates are ranked by cumulative log-probability (ties:
//!   lower token id, then earlier beam). An EOS candidate ranked inside the
//!   first `group_size` finishes a hypothesis; other candidates become live
//!   beams until the group is full again.
//!
//! Beams never point at their parents: each one carries its whole token log,
//! so forking copies the log and the model cache.
//!
//! Finished hypotheses are ranked by `cumulative_log_prob / len^length_penalty`
//! where `len` counts generated tokens, EOS included.

use std::cmp::Ordering;

use tracing::{debug, trace};

use super::logits::{log_softmax, process_logits, row_to_vec};
use super::pipeline::DecodingStats;
use crate::config::{GenerationConfig, StopCriteria};
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::error::{Error, Result};
use crate::model::{CacheHandle, LanguageModel, TokenId};

/// Phase of a beam group within the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    /// Live beams need next-token logits.
    Expanding,
    /// Logits are turned into scored candidates.
    Scoring,
    /// Candidates are cut back to the group width.
    Pruning,
    /// The group stopped searching.
    Terminated,
}

/// A live beam and, once expanded, its next-token logits.
#[derive(Debug)]
struct Beam {
    seq: Sequence,
    logits: Option<Vec<f32>>,
}

/// One scored expansion of a live beam.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: TokenId,
    log_prob: f32,
    score: f32,
}

/// Best finished hypotheses of a group, best first, at most `capacity`.
#[derive(Debug)]
struct FinishedBeams {
    hypotheses: Vec<Sequence>,
    capacity: usize,
    length_penalty: f32,
}

impl FinishedBeams {
    fn new(capacity: usize, length_penalty: f32) -> Self {
        Self {
            hypotheses: Vec::with_capacity(capacity + 1),
            capacity,
            length_penalty,
        }
    }

    fn add(&mut self, seq: Sequence) {
        if !seq.cumulative_log_prob().is_finite() {
            return;
        }
        self.hypotheses.push(seq);
        let lp = self.length_penalty;
        self.hypotheses.sort_by(|a, b| rank_order(a, b, lp));
        self.hypotheses.truncate(self.capacity);
    }

    fn len(&self) -> usize {
        self.hypotheses.len()
    }

    fn is_full(&self) -> bool {
        self.hypotheses.len() >= self.capacity
    }

    fn worst_score(&self) -> f32 {
        self.hypotheses
            .last()
            .map_or(f32::NEG_INFINITY, |seq| seq.normalized_score(self.length_penalty))
    }
}

/// Beams of one diversity group.
#[derive(Debug)]
pub struct BeamGroup {
    index: usize,
    state: GroupState,
    live: Vec<Beam>,
    finished: FinishedBeams,
}

impl BeamGroup {
    /// Position of the group.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current phase.
    pub fn state(&self) -> GroupState {
        self.state
    }

    /// Number of live beams.
    pub fn num_live(&self) -> usize {
        self.live.len()
    }

    /// Finished hypotheses, best first.
    pub fn finished(&self) -> &[Sequence] {
        &self.finished.hypotheses
    }

    fn take_caches(&mut self) -> Vec<CacheHandle> {
        self.live
            .iter_mut()
            .filter_map(|beam| beam.seq.take_cache())
            .collect()
    }
}

/// Grouped diverse beam search over one prompt.
///
/// # Example
///
/// ```
/// use nano_genai::engine::beam_search::BeamSearcher;
/// use nano_genai::engine::DecodingStats;
/// use nano_genai::model::ScriptedModel;
/// use nano_genai::GenerationConfig;
///
/// let config = GenerationConfig {
///     max_new_tokens: Some(4),
///     num_beams: 4,
///     num_beam_groups: 2,
///     num_return_sequences: 4,
///     ..Default::default()
/// };
/// let mut model = ScriptedModel::hashed(16, 1);
/// let mut stats = DecodingStats::default();
///
/// let searcher = BeamSearcher::new(vec![1, 2, 3], &config, 4);
/// let results = searcher.run(&mut model, None, &mut stats).unwrap();
/// assert_eq!(results.len(), 4);
/// assert_eq!(model.live_caches(), 0);
/// ```
#[derive(Debug)]
pub struct BeamSearcher {
    config: GenerationConfig,
    prompt: Vec<TokenId>,
    max_new_tokens: usize,
    group_size: usize,
    groups: Vec<BeamGroup>,
    step: usize,
    next_seq_id: SequenceId,
}

impl BeamSearcher {
    /// Create a searcher with one seed beam per group.
    pub fn new(prompt: Vec<TokenId>, config: &GenerationConfig, max_new_tokens: usize) -> Self {
        let num_groups = config.num_beam_groups.max(1);
        let group_size = config.group_size().max(1);

        let groups = (0..num_groups)
            .map(|index| {
                let mut seq = Sequence::new(index as SequenceId);
                seq.set_beam_group(index);
                BeamGroup {
                    index,
                    state: GroupState::Expanding,
                    live: vec![Beam { seq, logits: None }],
                    finished: FinishedBeams::new(group_size, config.length_penalty),
                }
            })
            .collect();

        Self {
            config: config.clone(),
            prompt,
            max_new_tokens,
            group_size,
            groups,
            step: 0,
            next_seq_id: num_groups as SequenceId,
        }
    }

    // ========== Getters ==========

    /// Number of completed steps.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Beams per group.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// All beam groups.
    pub fn groups(&self) -> &[BeamGroup] {
        &self.groups
    }

    /// Whether every group has terminated.
    pub fn is_done(&self) -> bool {
        self.groups
            .iter()
            .all(|group| group.state == GroupState::Terminated)
    }

    // ========== Search ==========

    /// Run the search to completion.
    ///
    /// `cache`, when given, holds the first `n` prompt tokens and is owned by
    /// the searcher from now on. Every cache is released before returning,
    /// on success and on error. Returns at most `num_return_sequences`
    /// finished sequences, best first.
    pub fn run<M>(
        mut self,
        model: &mut M,
        cache: Option<(CacheHandle, usize)>,
        stats: &mut DecodingStats,
    ) -> Result<Vec<Sequence>>
    where
        M: LanguageModel + ?Sized,
    {
        let outcome = self
            .prefill(model, cache, stats)
            .and_then(|()| self.search(model, stats));
        self.release(model);
        outcome?;
        Ok(self.finalize())
    }

    fn prefill<M>(
        &mut self,
        model: &mut M,
        cache: Option<(CacheHandle, usize)>,
        stats: &mut DecodingStats,
    ) -> Result<()>
    where
        M: LanguageModel + ?Sized,
    {
        let (cache, num_cached) = match cache {
            Some(cache) => cache,
            None => (model.new_cache()?, 0),
        };
        let seed = self.seed_mut(0)?;
        seed.set_cache(cache, num_cached);

        let pending = self.prompt.get(num_cached..).unwrap_or_default();
        if pending.is_empty() {
            return Err(Error::Model(format!(
                "cache already holds all {num_cached} prompt tokens"
            )));
        }
        let (logits, cache) = model.infer(pending, cache)?;
        stats.infer_calls += 1;
        let row = row_to_vec(&logits, pending.len() - 1)?;

        let prompt_len = self.prompt.len();
        self.seed_mut(0)?.set_cache(cache, prompt_len);
        for g in 1..self.groups.len() {
            let fork = model.fork_cache(cache)?;
            self.seed_mut(g)?.set_cache(fork, prompt_len);
        }
        for group in &mut self.groups {
            for beam in &mut group.live {
                beam.logits = Some(row.clone());
            }
        }

        debug!(
            prompt_len,
            groups = self.groups.len(),
            group_size = self.group_size,
            "beam search prefill"
        );
        Ok(())
    }

    fn seed_mut(&mut self, group: usize) -> Result<&mut Sequence> {
        self.groups
            .get_mut(group)
            .and_then(|g| g.live.first_mut())
            .map(|beam| &mut beam.seq)
            .ok_or_else(|| Error::Model(format!("beam group {group} has no seed beam")))
    }

    fn search<M>(&mut self, model: &mut M, stats: &mut DecodingStats) -> Result<()>
    where
        M: LanguageModel + ?Sized,
    {
        while !self.is_done() {
            self.advance(model, stats)?;
        }
        Ok(())
    }

    /// Run one decoding step over every group that is still searching.
    fn advance<M>(&mut self, model: &mut M, stats: &mut DecodingStats) -> Result<()>
    where
        M: LanguageModel + ?Sized,
    {
        let mut step_tokens: Vec<TokenId> = Vec::new();
        for g in 0..self.groups.len() {
            if self.groups[g].state == GroupState::Terminated {
                continue;
            }
            self.expand_group(g, model, stats)?;
            let candidates = self.score_group(g, &step_tokens)?;
            let chosen = self.prune_group(g, candidates, model)?;
            step_tokens.extend(chosen);
            self.check_stop(g, model);
        }
        self.step += 1;
        stats.steps += 1;
        Ok(())
    }

    fn expand_group<M>(&mut self, g: usize, model: &mut M, stats: &mut DecodingStats) -> Result<()>
    where
        M: LanguageModel + ?Sized,
    {
        let group = &mut self.groups[g];
        for beam in group.live.iter_mut().filter(|beam| beam.logits.is_none()) {
            let (token, cache) = match (beam.seq.last_token_id(), beam.seq.cache()) {
                (Some(token), Some(cache)) => (token, cache),
                _ => return Err(Error::Model("live beam has no token or cache".to_string())),
            };
            let (logits, cache) = model.infer(&[token], cache)?;
            stats.infer_calls += 1;
            let num_cached = beam.seq.num_cached_tokens() + 1;
            beam.seq.set_cache(cache, num_cached);
            beam.logits = Some(row_to_vec(&logits, 0)?);
        }
        group.state = GroupState::Scoring;
        Ok(())
    }

    fn score_group(&mut self, g: usize, step_tokens: &[TokenId]) -> Result<Vec<Candidate>> {
        let per_beam = 2 * self.group_size;
        let diversity = self.groups.len() > 1;
        let group = &mut self.groups[g];

        let mut candidates = Vec::with_capacity(group.live.len() * per_beam);
        for (b, beam) in group.live.iter_mut().enumerate() {
            let mut row = beam
                .logits
                .take()
                .ok_or_else(|| Error::Model("beam scored before expansion".to_string()))?;
            let history = beam.seq.history(&self.prompt);
            process_logits(&mut row, &history, &self.config);

            let mut log_probs = log_softmax(&row)?;
            if diversity {
                for &token in step_tokens {
                    if let Some(lp) = log_probs.get_mut(token as usize) {
                        *lp -= self.config.diversity_penalty;
                    }
                }
            }

            let mut order: Vec<usize> = (0..log_probs.len())
                .filter(|&t| log_probs[t].is_finite())
                .collect();
            order.sort_by(|&a, &b| log_probs[b].total_cmp(&log_probs[a]).then(a.cmp(&b)));

            let cumulative = beam.seq.cumulative_log_prob();
            candidates.extend(order.into_iter().take(per_beam).map(|t| Candidate {
                beam: b,
                token: t as TokenId,
                log_prob: log_probs[t],
                score: cumulative + log_probs[t],
            }));
        }

        group.state = GroupState::Pruning;
        Ok(candidates)
    }

    /// Keep the best `group_size` expansions and return the tokens they chose.
    fn prune_group<M>(
        &mut self,
        g: usize,
        mut candidates: Vec<Candidate>,
        model: &mut M,
    ) -> Result<Vec<TokenId>>
    where
        M: LanguageModel + ?Sized,
    {
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.token.cmp(&b.token))
                .then(a.beam.cmp(&b.beam))
        });
        candidates.truncate(2 * self.group_size);

        let step = self.step;
        let mut selected = Vec::with_capacity(self.group_size);
        let mut ended = Vec::new();
        for (rank, candidate) in candidates.into_iter().enumerate() {
            if self.config.is_stop_token(candidate.token) {
                if rank < self.group_size {
                    ended.push(candidate);
                }
                continue;
            }
            selected.push(candidate);
            if selected.len() == self.group_size {
                break;
            }
        }

        // Fork before touching the live set so a failure leaves it intact.
        let group = &mut self.groups[g];
        let mut used = vec![false; group.live.len()];
        let mut caches = Vec::with_capacity(selected.len());
        let mut forked = Vec::new();
        let mut failure = None;
        for candidate in &selected {
            let Some(parent) = group.live[candidate.beam].seq.cache() else {
                failure = Some(Error::Model("live beam has no cache".to_string()));
                break;
            };
            if !used[candidate.beam] {
                used[candidate.beam] = true;
                caches.push(parent);
                continue;
            }
            match model.fork_cache(parent) {
                Ok(fork) => {
                    forked.push(fork);
                    caches.push(fork);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            for cache in forked {
                model.drop_cache(cache);
            }
            return Err(e);
        }

        let parents = std::mem::take(&mut group.live);
        for (b, parent) in parents.iter().enumerate() {
            if !used[b] {
                if let Some(cache) = parent.seq.cache() {
                    model.drop_cache(cache);
                }
            }
        }

        for candidate in &ended {
            let mut seq = parents[candidate.beam].seq.fork(self.next_seq_id);
            self.next_seq_id += 1;
            seq.append_token(candidate.token, candidate.log_prob);
            seq.set_finished(FinishReason::EndOfSequence, step);
            group.finished.add(seq);
        }

        let mut tokens = Vec::with_capacity(selected.len());
        for (candidate, cache) in selected.iter().zip(caches) {
            let parent = &parents[candidate.beam].seq;
            let mut seq = parent.fork(self.next_seq_id);
            self.next_seq_id += 1;
            seq.append_token(candidate.token, candidate.log_prob);
            tokens.push(candidate.token);

            if seq.output_len() >= self.max_new_tokens {
                model.drop_cache(cache);
                seq.set_finished(FinishReason::MaxTokens, step);
                group.finished.add(seq);
            } else {
                seq.set_cache(cache, parent.num_cached_tokens());
                group.live.push(Beam { seq, logits: None });
            }
        }

        trace!(
            group = g,
            step,
            live = group.live.len(),
            finished = group.finished.len(),
            "beam group pruned"
        );
        Ok(tokens)
    }

    /// Apply the stop rule and move the group to its next phase.
    fn check_stop<M>(&mut self, g: usize, model: &mut M)
    where
        M: LanguageModel + ?Sized,
    {
        let max_len = self.max_new_tokens.max(1) as f32;
        let group = &mut self.groups[g];

        let done = group.live.is_empty()
            || match self.config.stop_criteria {
                StopCriteria::Never => false,
                StopCriteria::Early => group.finished.is_full(),
                StopCriteria::Heuristic => {
                    let best_live = group
                        .live
                        .iter()
                        .map(|beam| beam.seq.cumulative_log_prob())
                        .fold(f32::NEG_INFINITY, f32::max);
                    let best_attainable = best_live / max_len.powf(self.config.length_penalty);
                    group.finished.is_full() && group.finished.worst_score() >= best_attainable
                }
            };

        if done {
            for cache in group.take_caches() {
                model.drop_cache(cache);
            }
            group.live.clear();
            group.state = GroupState::Terminated;
            debug!(
                group = g,
                step = self.step,
                finished = group.finished.len(),
                "beam group terminated"
            );
        } else {
            group.state = GroupState::Expanding;
        }
    }

    /// Drop every cache still held by a live beam.
    fn release<M>(&mut self, model: &mut M)
    where
        M: LanguageModel + ?Sized,
    {
        for group in &mut self.groups {
            for cache in group.take_caches() {
                model.drop_cache(cache);
            }
        }
    }

    /// Best finished hypotheses across all groups.
    fn finalize(self) -> Vec<Sequence> {
        let lp = self.config.length_penalty;
        let mut results: Vec<Sequence> = self
            .groups
            .into_iter()
            .flat_map(|group| group.finished.hypotheses)
            .collect();
        results.sort_by(|a, b| rank_order(a, b, lp));
        results.truncate(self.config.num_return_sequences);
        results
    }
}

/// Best normalized score first, then earlier finish, then lower last token.
fn rank_order(a: &Sequence, b: &Sequence, length_penalty: f32) -> Ordering {
    b.normalized_score(length_penalty)
        .total_cmp(&a.normalized_score(length_penalty))
        .then(a.finished_at().cmp(&b.finished_at()))
        .then(a.last_token_id().cmp(&b.last_token_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedModel;

    fn beam_config(num_beams: usize, groups: usize, max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: Some(max_new_tokens),
            num_beams,
            num_beam_groups: groups,
            num_return_sequences: num_beams,
            ..Default::default()
        }
    }

    /// Token `t` always scores `-0.01 * t`, so lower ids are preferred.
    fn flat_model(vocab: usize) -> ScriptedModel {
        ScriptedModel::new(vocab, move |_| (0..vocab).map(|t| -0.01 * t as f32).collect())
    }

    #[test]
    fn test_rank_order() {
        let mut a = Sequence::new(0);
        a.append_token(3, -1.0);
        a.set_finished(FinishReason::MaxTokens, 0);
        let mut b = Sequence::new(1);
        b.append_token(2, -1.0);
        b.set_finished(FinishReason::MaxTokens, 0);
        let mut c = Sequence::new(2);
        c.append_token(9, -0.5);
        c.set_finished(FinishReason::MaxTokens, 0);

        let mut all = vec![a, b, c];
        all.sort_by(|x, y| rank_order(x, y, 1.0));
        let ids: Vec<_> = all.iter().map(Sequence::seq_id).collect();
        assert_eq!(ids, vec![2, 1, 0]);
    }

    #[test]
    fn test_groups_diverge_on_first_token() {
        let config = beam_config(4, 2, 3);
        let mut model = flat_model(32);
        let mut stats = DecodingStats::default();

        let results = BeamSearcher::new(vec![30], &config, 3)
            .run(&mut model, None, &mut stats)
            .unwrap();

        assert_eq!(results.len(), 4);
        let mut firsts: Vec<TokenId> = results.iter().map(|s| s.output_token_ids()[0]).collect();
        firsts.sort();
        firsts.dedup();
        assert_eq!(firsts, vec![0, 1, 2, 3]);
        assert_eq!(model.live_caches(), 0);
    }

    #[test]
    fn test_eos_finishes_hypothesis() {
        let mut config = beam_config(2, 1, 5);
        config.eos_token_id = Some(0);
        config.stop_criteria = StopCriteria::Early;
        let mut model = flat_model(8);
        let mut stats = DecodingStats::default();

        let results = BeamSearcher::new(vec![5], &config, 5)
            .run(&mut model, None, &mut stats)
            .unwrap();

        let best = &results[0];
        assert_eq!(best.output_token_ids(), &[0]);
        assert_eq!(best.finish_reason(), Some(FinishReason::EndOfSequence));
        assert_eq!(model.live_caches(), 0);
    }

    /// One finished hypothesis scoring -1.0 and one live beam with `live_score`.
    fn heuristic_searcher(live_score: f32) -> BeamSearcher {
        let config = GenerationConfig {
            stop_criteria: StopCriteria::Heuristic,
            ..beam_config(1, 1, 4)
        };
        let mut searcher = BeamSearcher::new(vec![1], &config, 4);

        let mut done = Sequence::new(10);
        done.append_token(0, -1.0);
        done.set_finished(FinishReason::EndOfSequence, 0);
        searcher.groups[0].finished.add(done);

        let mut live = Sequence::new(11);
        live.append_token(2, live_score);
        searcher.groups[0].live = vec![Beam {
            seq: live,
            logits: None,
        }];
        searcher
    }

    #[test]
    fn test_heuristic_stops_on_equal_bound() {
        // best attainable: -4.0 / 4^1 == worst finished -1.0
        let mut model = flat_model(4);
        let mut searcher = heuristic_searcher(-4.0);
        searcher.check_stop(0, &mut model);
        assert_eq!(searcher.groups[0].state(), GroupState::Terminated);
        assert_eq!(searcher.groups[0].num_live(), 0);

        let mut searcher = heuristic_searcher(-3.5);
        searcher.check_stop(0, &mut model);
        assert_eq!(searcher.groups[0].state(), GroupState::Expanding);
        assert_eq!(searcher.groups[0].num_live(), 1);
    }

    #[test]
    fn test_failure_releases_caches() {
        let config = beam_config(4, 2, 6);
        let mut model = flat_model(16).fail_at_call(3);
        let mut stats = DecodingStats::default();

        let result = BeamSearcher::new(vec![1, 2], &config, 6).run(&mut model, None, &mut stats);

        assert!(result.is_err());
        assert_eq!(model.live_caches(), 0);
        assert_eq!(model.stats().invalid_drops, 0);
    }
}
