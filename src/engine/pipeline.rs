//! Text generation pipeline.
//!
//! [`LlmPipeline`] drives one language model through a full request:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LlmPipeline                            │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!        generate()          ▼
//!   ┌──────────────┐  validate, resolve mode, budget
//!   │ GenerationCfg│  (no inference before this passes)
//!   └──────────────┘
//!          │
//!          ├── BeamSearch ─────────► BeamSearcher::run
//!          │
//!          └── Greedy / Multinomial
//!                   │
//!                   ▼  per step
//!          ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//!          │   Propose    │ ─► │ Model infer  │ ─► │   Verify /   │
//!          │ (optional)   │    │ pending + K  │    │   Sample     │
//!          └──────────────┘    └──────────────┘    └──────────────┘
//!                                                         │
//!                                                         ▼
//!                                                  ┌──────────────┐
//!                                                  │  Streamer    │
//!                                                  └──────────────┘
//! ```
//!
//! Each sequence's cache holds its whole history except the last token, so
//! every step feeds the uncached tail (the prompt on the first step, one
//! token afterwards) plus any proposal, then trims whatever was rejected.
//!
//! ## Example
//!
//! ```
//! use nano_genai::{GenerationConfig, LlmPipeline, ScriptedModel};
//!
//! let model = ScriptedModel::hashed(64, 0);
//! let mut pipeline = LlmPipeline::new(model);
//!
//! let config = GenerationConfig { max_new_tokens: Some(8), ..Default::default() };
//! let output = pipeline.generate(&[1, 2, 3], &config, None).unwrap();
//! assert_eq!(output.sequences.len(), 1);
//! assert!(output.sequences[0].token_ids.len() <= 8);
//! ```

use tracing::{debug, warn};

use super::beam_search::BeamSearcher;
use super::chat::ChatSession;
use super::logits::row_to_vec;
use super::sampler::{SampledToken, Sampler};
use super::streamer::Streamer;
use crate::config::{ConfigOverrides, DecodingMode, GenerationConfig};
use crate::core::sequence::{FinishReason, Sequence};
use crate::core::sequence_group::{RequestId, SequenceGroup};
use crate::error::{ConfigError, Error, Result};
use crate::model::{CacheHandle, LanguageModel, TokenId};
use crate::speculative::{verify_proposal, Proposal, ProposalSource, SpeculativeConfig};
use crate::tokenizer::TextCodec;

/// Counters collected while decoding one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodingStats {
    /// Decoding steps.
    pub steps: usize,
    /// Calls to the target model's `infer`.
    pub infer_calls: usize,
    /// Tokens offered by the proposal source.
    pub proposed_tokens: usize,
    /// Proposed tokens the target model agreed with.
    pub accepted_tokens: usize,
}

impl DecodingStats {
    /// Fraction of proposed tokens that were accepted.
    pub fn acceptance_rate(&self) -> f32 {
        if self.proposed_tokens == 0 {
            0.0
        } else {
            self.accepted_tokens as f32 / self.proposed_tokens as f32
        }
    }
}

/// One returned sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    /// Generated token IDs (prompt excluded, EOS included when produced).
    pub token_ids: Vec<TokenId>,
    /// Cumulative log-probability, length-normalized for beam search.
    pub score: f32,
    /// Reason for finishing.
    pub finish_reason: FinishReason,
}

/// Output of a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Returned sequences; best first for beam search.
    pub sequences: Vec<GeneratedSequence>,
    /// Decoding counters.
    pub stats: DecodingStats,
}

impl GenerationOutput {
    /// The first returned sequence.
    pub fn best(&self) -> Option<&GeneratedSequence> {
        self.sequences.first()
    }
}

/// Generation pipeline over a language model.
pub struct LlmPipeline<M: LanguageModel> {
    /// The target model.
    model: M,
    /// Default configuration for `generate_with_overrides`.
    config: GenerationConfig,
    /// Optional text codec for the text entry points.
    tokenizer: Option<Box<dyn TextCodec + Send + Sync>>,
    /// Optional acceleration.
    proposer: Option<ProposalSource>,
    /// Chat session state.
    chat: ChatSession,
    /// Counter for request IDs.
    next_request_id: RequestId,
}

impl<M: LanguageModel> LlmPipeline<M> {
    /// Create a pipeline with the default configuration.
    pub fn new(model: M) -> Self {
        Self {
            model,
            config: GenerationConfig::default(),
            tokenizer: None,
            proposer: None,
            chat: ChatSession::new(),
            next_request_id: 1,
        }
    }

    /// Set the default configuration.
    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a tokenizer for the text entry points.
    pub fn with_tokenizer<T>(mut self, tokenizer: T) -> Self
    where
        T: TextCodec + Send + Sync + 'static,
    {
        self.tokenizer = Some(Box::new(tokenizer));
        self
    }

    /// Enable speculative decoding with a draft model.
    pub fn with_draft_model<D>(mut self, draft: D, config: SpeculativeConfig) -> Result<Self>
    where
        D: LanguageModel + Send + 'static,
    {
        config.validate()?;
        self.proposer = Some(ProposalSource::draft(draft, &config));
        Ok(self)
    }

    /// Enable prompt-lookup decoding.
    pub fn with_prompt_lookup(mut self, config: SpeculativeConfig) -> Result<Self> {
        config.validate()?;
        self.proposer = Some(ProposalSource::prompt_lookup(&config));
        Ok(self)
    }

    // ========== Getters ==========

    /// Get the default configuration.
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Get the model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Get the model mutably.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Get the proposal source, if acceleration is enabled.
    pub fn proposal_source(&self) -> Option<&ProposalSource> {
        self.proposer.as_ref()
    }

    // ========== Chat ==========

    /// Open a chat session.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSessionState`] if a session is already open.
    pub fn start_chat(&mut self) -> Result<()> {
        self.chat.start()?;
        debug!("chat started");
        Ok(())
    }

    /// Close the chat session and release its cache. No-op when idle.
    pub fn finish_chat(&mut self) {
        let was_active = self.chat.is_active();
        if let Some(cache) = self.chat.finish() {
            self.model.drop_cache(cache);
            debug!(cache = cache.id(), "chat cache released");
        }
        if was_active {
            debug!("chat finished");
        }
    }

    /// Whether a chat session is open.
    pub fn is_chat_active(&self) -> bool {
        self.chat.is_active()
    }

    /// Tokens of the completed chat turns.
    pub fn chat_history(&self) -> &[TokenId] {
        self.chat.history()
    }

    // ========== Generation ==========

    /// Generate with the default configuration updated by `overrides`.
    pub fn generate_with_overrides(
        &mut self,
        prompt: &[TokenId],
        overrides: &ConfigOverrides,
        streamer: Option<&mut dyn Streamer>,
    ) -> Result<GenerationOutput> {
        let config = self.config.with_overrides(overrides)?;
        self.generate(prompt, &config, streamer)
    }

    /// Encode `prompt`, generate, and decode every returned sequence.
    pub fn generate_text(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
        streamer: Option<&mut dyn Streamer>,
    ) -> Result<Vec<String>> {
        let prompt_ids = self.codec()?.encode(prompt)?;
        let output = self.generate(&prompt_ids, config, streamer)?;

        let codec = self.codec()?;
        output
            .sequences
            .iter()
            .map(|seq| codec.decode(&seq.token_ids))
            .collect()
    }

    fn codec(&self) -> Result<&(dyn TextCodec + Send + Sync)> {
        self.tokenizer
            .as_deref()
            .ok_or_else(|| Error::Tokenization("no tokenizer attached".to_string()))
    }

    /// Generate continuations of `prompt`.
    ///
    /// The configuration is validated and the token budget resolved before
    /// the model is touched. In an active chat the prompt is appended to the
    /// session history. A streamer, when given, receives every token of the
    /// single produced sequence except EOS, and `end()` once decoding is over.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an invalid configuration, for a streamer or a
    ///   proposal source combined with beam search or several samples, or
    ///   when `max_length` leaves no room after the prompt
    /// - [`Error::EmptyPrompt`] for an empty prompt
    /// - model errors, after every cache of the request has been dropped
    pub fn generate(
        &mut self,
        prompt: &[TokenId],
        config: &GenerationConfig,
        mut streamer: Option<&mut dyn Streamer>,
    ) -> Result<GenerationOutput> {
        config.validate()?;
        let mode = config.resolve_mode();
        let single = match mode {
            DecodingMode::Greedy => true,
            DecodingMode::Multinomial => config.num_return_sequences == 1,
            DecodingMode::BeamSearch => false,
        };
        if !single && streamer.is_some() {
            return Err(ConfigError::ConflictingMode(format!(
                "streaming needs a single output sequence, but {} returns {}",
                mode.as_str(),
                config.num_return_sequences
            ))
            .into());
        }
        if !single && self.proposer.is_some() {
            return Err(ConfigError::ConflictingMode(format!(
                "speculative decoding needs a single output sequence, but {} returns {}",
                mode.as_str(),
                config.num_return_sequences
            ))
            .into());
        }
        if prompt.is_empty() {
            return Err(Error::EmptyPrompt);
        }

        let full_prompt = if self.chat.is_active() {
            self.chat.turn_prompt(prompt)
        } else {
            prompt.to_vec()
        };
        let max_new_tokens = config.get_max_new_tokens(full_prompt.len())?;

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        debug!(
            request_id,
            mode = mode.as_str(),
            prompt_len = full_prompt.len(),
            max_new_tokens,
            chat = self.chat.is_active(),
            "generation started"
        );

        let session_cache = self.chat.take_cache();
        let mut stats = DecodingStats::default();
        let output = match mode {
            DecodingMode::BeamSearch => {
                self.run_beam_search(full_prompt, config, max_new_tokens, session_cache, &mut stats)
            }
            DecodingMode::Greedy | DecodingMode::Multinomial => {
                let group =
                    SequenceGroup::new(request_id, full_prompt, config.clone(), max_new_tokens);
                self.run_sampling(group, session_cache, &mut streamer, &mut stats)
            }
        };

        let sequences = match output {
            Ok(sequences) => sequences,
            Err(e) => {
                warn!(request_id, error = %e, "generation failed");
                return Err(e);
            }
        };
        if let Some(streamer) = streamer.as_mut() {
            streamer.end();
        }

        debug!(
            request_id,
            sequences = sequences.len(),
            steps = stats.steps,
            infer_calls = stats.infer_calls,
            accepted = stats.accepted_tokens,
            proposed = stats.proposed_tokens,
            "generation finished"
        );
        Ok(GenerationOutput { sequences, stats })
    }

    fn run_beam_search(
        &mut self,
        prompt: Vec<TokenId>,
        config: &GenerationConfig,
        max_new_tokens: usize,
        session_cache: Option<(CacheHandle, usize)>,
        stats: &mut DecodingStats,
    ) -> Result<Vec<GeneratedSequence>> {
        let searcher = BeamSearcher::new(prompt.clone(), config, max_new_tokens);
        let results = searcher.run(&mut self.model, session_cache, stats)?;

        if self.chat.is_active() {
            // Beam caches are gone; the next turn prefills from scratch.
            let history = match results.first() {
                Some(best) => best.history(&prompt),
                None => prompt,
            };
            self.chat.commit(history, None);
        }

        let lp = config.length_penalty;
        Ok(results
            .into_iter()
            .map(|seq| to_output(&seq, seq.normalized_score(lp)))
            .collect())
    }

    fn run_sampling(
        &mut self,
        mut group: SequenceGroup,
        session_cache: Option<(CacheHandle, usize)>,
        streamer: &mut Option<&mut dyn Streamer>,
        stats: &mut DecodingStats,
    ) -> Result<Vec<GeneratedSequence>> {
        if let Err(e) = self.decode_group(&mut group, session_cache, streamer, stats) {
            for cache in group.take_caches() {
                self.model.drop_cache(cache);
            }
            return Err(e);
        }

        let keep_cache = self.chat.is_active() && group.sequences().len() == 1;
        let history = group.history(0);
        let retained = if keep_cache {
            group.sequence_mut(0).and_then(|seq| {
                let num_cached = seq.num_cached_tokens();
                seq.take_cache().map(|cache| (cache, num_cached))
            })
        } else {
            None
        };
        for cache in group.take_caches() {
            self.model.drop_cache(cache);
        }
        if self.chat.is_active() {
            self.chat.commit(history, retained);
        }

        Ok(group
            .into_sequences()
            .iter()
            .map(|seq| to_output(seq, seq.cumulative_log_prob()))
            .collect())
    }

    /// Decode every sequence of `group` to completion.
    fn decode_group(
        &mut self,
        group: &mut SequenceGroup,
        session_cache: Option<(CacheHandle, usize)>,
        streamer: &mut Option<&mut dyn Streamer>,
        stats: &mut DecodingStats,
    ) -> Result<()> {
        let config = group.config().clone();
        let mut sampler = Sampler::new(&config);

        let (cache, num_cached) = match session_cache {
            Some(cache) => cache,
            None => (self.model.new_cache()?, 0),
        };
        seq_mut(group, 0)?.set_cache(cache, num_cached);

        let num_samples = if config.is_multinomial() {
            config.num_return_sequences
        } else {
            1
        };
        if num_samples > 1 {
            self.prefill_samples(group, num_samples, &mut sampler, stats)?;
        }

        while !group.is_finished() {
            for idx in group.running_indices() {
                self.step_sequence(group, idx, &mut sampler, streamer, stats)?;
            }
            stats.steps += 1;
        }
        Ok(())
    }

    /// Prefill the prompt once and draw the first token of every sample.
    fn prefill_samples(
        &mut self,
        group: &mut SequenceGroup,
        num_samples: usize,
        sampler: &mut Sampler,
        stats: &mut DecodingStats,
    ) -> Result<()> {
        let prompt = group.prompt_token_ids().to_vec();
        let seed = seq_mut(group, 0)?;
        let num_cached = seed.num_cached_tokens();
        let cache = seed
            .cache()
            .ok_or_else(|| Error::Model("sequence has no cache".to_string()))?;

        let pending = &prompt[num_cached..];
        if pending.is_empty() {
            return Err(Error::Model("no uncached tokens to feed".to_string()));
        }
        let (logits, cache) = self.model.infer(pending, cache)?;
        stats.infer_calls += 1;
        seq_mut(group, 0)?.set_cache(cache, prompt.len());
        let row = row_to_vec(&logits, pending.len() - 1)?;

        for _ in 1..num_samples {
            let idx = group
                .fork_sequence(0)
                .ok_or_else(|| Error::Model("cannot fork seed sequence".to_string()))?;
            let fork = self.model.fork_cache(cache)?;
            seq_mut(group, idx)?.set_cache(fork, prompt.len());
        }

        let step = stats.steps;
        let max_new_tokens = group.max_new_tokens();
        let config = group.config().clone();
        for idx in 0..num_samples {
            let sampled = sampler.select(row.clone(), &prompt)?;
            let seq = seq_mut(group, idx)?;
            let Some(sampled) = sampled else {
                seq.set_finished(FinishReason::VocabularyExhausted, step);
                continue;
            };
            seq.append_token(sampled.token, sampled.log_prob);
            if config.is_stop_token(sampled.token) {
                seq.set_finished(FinishReason::EndOfSequence, step);
            } else if seq.output_len() >= max_new_tokens {
                seq.set_finished(FinishReason::MaxTokens, step);
            }
        }
        stats.steps += 1;
        Ok(())
    }

    /// Advance sequence `idx` by one model call.
    ///
    /// Without a proposal this emits exactly one token. With one, the
    /// pending tokens and the proposal are scored together and every
    /// accepted token, plus the target's own next token, is emitted.
    fn step_sequence(
        &mut self,
        group: &mut SequenceGroup,
        idx: usize,
        sampler: &mut Sampler,
        streamer: &mut Option<&mut dyn Streamer>,
        stats: &mut DecodingStats,
    ) -> Result<()> {
        let step = stats.steps;
        let history = group.history(idx);
        let remaining = group.remaining_budget(idx);
        let prompt_len = group.prompt_len();
        let config = group.config().clone();

        let seq = seq_mut(group, idx)?;
        let num_cached = seq.num_cached_tokens();
        let cache = seq
            .cache()
            .ok_or_else(|| Error::Model("sequence has no cache".to_string()))?;
        let pending = &history[num_cached..];
        if pending.is_empty() {
            return Err(Error::Model("no uncached tokens to feed".to_string()));
        }

        let mut proposal = match self.proposer.as_mut() {
            Some(source) if remaining > 1 => source.propose(&history, remaining - 1),
            _ => Proposal::empty(),
        };

        let mut input = pending.to_vec();
        input.extend_from_slice(proposal.tokens());
        let (logits, cache) = self.model.infer(&input, cache)?;
        stats.infer_calls += 1;
        seq.set_cache(cache, num_cached + input.len());

        let verification = verify_proposal(
            sampler,
            &logits,
            pending.len() - 1,
            &history,
            proposal.tokens(),
            remaining,
            |token| config.is_stop_token(token),
        )?;
        proposal.set_accepted(verification.accepted);
        stats.proposed_tokens += proposal.len();
        stats.accepted_tokens += proposal.accepted();

        emit_tokens(seq, &verification.tokens, &config, remaining, step, streamer);
        if verification.exhausted && !seq.is_finished() {
            debug!(step, "no selectable token left");
            seq.set_finished(FinishReason::VocabularyExhausted, step);
        }

        // The newest token stays uncached; rejected proposal tokens go too.
        let keep = (prompt_len + seq.output_len()).saturating_sub(1);
        if seq.num_cached_tokens() > keep {
            self.model.trim_cache(cache, keep)?;
            seq.set_num_cached_tokens(keep);
        }
        Ok(())
    }
}

impl<M: LanguageModel> Drop for LlmPipeline<M> {
    fn drop(&mut self) {
        self.finish_chat();
    }
}

/// Append verified tokens, stopping at EOS, the budget or a streamer stop.
fn emit_tokens(
    seq: &mut Sequence,
    tokens: &[SampledToken],
    config: &GenerationConfig,
    remaining: usize,
    step: usize,
    streamer: &mut Option<&mut dyn Streamer>,
) {
    for (emitted, sampled) in tokens.iter().enumerate() {
        seq.append_token(sampled.token, sampled.log_prob);
        if config.is_stop_token(sampled.token) {
            seq.set_finished(FinishReason::EndOfSequence, step);
            return;
        }
        if let Some(streamer) = streamer.as_mut() {
            if streamer.write(sampled.token).is_stop() {
                debug!(step, "streamer requested stop");
                seq.set_finished(FinishReason::CancelledByStreamer, step);
                return;
            }
        }
        if emitted + 1 >= remaining {
            seq.set_finished(FinishReason::MaxTokens, step);
            return;
        }
    }
}

fn seq_mut(group: &mut SequenceGroup, idx: usize) -> Result<&mut Sequence> {
    group
        .sequence_mut(idx)
        .ok_or_else(|| Error::Model(format!("no sequence at position {idx}")))
}

fn to_output(seq: &Sequence, score: f32) -> GeneratedSequence {
    GeneratedSequence {
        token_ids: seq.output_token_ids().to_vec(),
        score,
        finish_reason: seq.finish_reason().unwrap_or(FinishReason::MaxTokens),
    }
}
