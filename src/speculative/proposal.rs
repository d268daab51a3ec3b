//! Proposal sources.
//!
//! A proposal source guesses the next few tokens of a sequence cheaply. Both
//! sources share the same contract: given the full history and an upper
//! bound, return zero or more tokens. An empty proposal is always valid and
//! turns the next step into plain single-token decoding.
//!
//! ```text
//! ProposalSource::Draft         small model, greedy, K tokens
//! ProposalSource::PromptLookup  copy what followed an earlier match of the
//!                               history suffix
//! ```

use tracing::{debug, trace, warn};

use super::config::SpeculativeConfig;
use crate::engine::logits::{argmax, row_to_vec};
use crate::error::{Error, Result};
use crate::model::{CacheHandle, LanguageModel, TokenId};

/// Tokens proposed for one step, and how many of them the target accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    tokens: Vec<TokenId>,
    accepted: usize,
}

impl Proposal {
    /// Create a proposal.
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            accepted: 0,
        }
    }

    /// Proposal of length zero.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the proposed tokens.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Number of proposed tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing was proposed.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of tokens the target model agreed with.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Record the verification outcome.
    pub fn set_accepted(&mut self, accepted: usize) {
        self.accepted = accepted.min(self.tokens.len());
    }
}

/// Where multi-token proposals come from.
pub enum ProposalSource {
    /// A smaller draft model.
    Draft(DraftProposer),
    /// N-gram lookup in the history itself.
    PromptLookup(PromptLookup),
}

impl ProposalSource {
    /// Draft-model speculative decoding.
    pub fn draft<M>(model: M, config: &SpeculativeConfig) -> Self
    where
        M: LanguageModel + Send + 'static,
    {
        Self::Draft(DraftProposer::new(model, config))
    }

    /// Prompt-lookup decoding.
    pub fn prompt_lookup(config: &SpeculativeConfig) -> Self {
        Self::PromptLookup(PromptLookup::new(config))
    }

    /// Propose at most `max_tokens` continuations of `history`.
    pub fn propose(&mut self, history: &[TokenId], max_tokens: usize) -> Proposal {
        let max_tokens = max_tokens.min(self.num_speculative_tokens());
        if max_tokens == 0 || history.is_empty() {
            return Proposal::empty();
        }
        let tokens = match self {
            Self::Draft(draft) => draft.propose(history, max_tokens),
            Self::PromptLookup(lookup) => lookup.propose(history, max_tokens),
        };
        trace!(source = self.name(), proposed = tokens.len(), "proposal");
        Proposal::new(tokens)
    }

    /// Upper bound on tokens per proposal (K).
    pub fn num_speculative_tokens(&self) -> usize {
        match self {
            Self::Draft(draft) => draft.num_speculative_tokens,
            Self::PromptLookup(lookup) => lookup.num_speculative_tokens,
        }
    }

    /// Whether the source can currently produce proposals.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Draft(draft) => draft.is_available(),
            Self::PromptLookup(_) => true,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draft(_) => "draft",
            Self::PromptLookup(_) => "prompt_lookup",
        }
    }
}

/// Proposes tokens by running a draft model greedily.
///
/// The draft keeps its own cache across steps. `cached_tokens` mirrors what
/// that cache holds, so before each proposal the cache is trimmed back to the
/// longest prefix shared with the current history and only the difference is
/// fed. Rejected proposals and new chat turns therefore cost no re-prefill.
///
/// Any draft failure disables the proposer for good: its cache is released
/// and every later proposal is empty.
pub struct DraftProposer {
    model: Box<dyn LanguageModel + Send>,
    num_speculative_tokens: usize,
    cache: Option<CacheHandle>,
    cached_tokens: Vec<TokenId>,
    available: bool,
}

impl DraftProposer {
    /// Wrap a draft model.
    pub fn new<M>(model: M, config: &SpeculativeConfig) -> Self
    where
        M: LanguageModel + Send + 'static,
    {
        Self {
            model: Box::new(model),
            num_speculative_tokens: config.num_speculative_tokens,
            cache: None,
            cached_tokens: Vec::new(),
            available: true,
        }
    }

    /// Whether the draft model is still usable.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Tokens currently held by the draft cache.
    pub fn cached_tokens(&self) -> &[TokenId] {
        &self.cached_tokens
    }

    /// Release the draft cache. The next proposal starts from scratch.
    pub fn release(&mut self) {
        if let Some(cache) = self.cache.take() {
            self.model.drop_cache(cache);
        }
        self.cached_tokens.clear();
    }

    fn propose(&mut self, history: &[TokenId], max_tokens: usize) -> Vec<TokenId> {
        if !self.available {
            return Vec::new();
        }
        match self.try_propose(history, max_tokens) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "draft model failed, continuing without speculation");
                self.available = false;
                self.release();
                Vec::new()
            }
        }
    }

    fn try_propose(&mut self, history: &[TokenId], max_tokens: usize) -> Result<Vec<TokenId>> {
        let mut cache = match self.cache {
            Some(cache) => cache,
            None => {
                let cache = self.model.new_cache()?;
                self.cache = Some(cache);
                self.cached_tokens.clear();
                cache
            }
        };

        // At least one history token must be fed to get logits.
        let common = common_prefix_len(&self.cached_tokens, history).min(history.len() - 1);
        if common < self.cached_tokens.len() {
            self.model.trim_cache(cache, common)?;
            self.cached_tokens.truncate(common);
        }

        let mut input = history[common..].to_vec();
        let mut proposal = Vec::with_capacity(max_tokens);
        loop {
            let (logits, next) = self.model.infer(&input, cache)?;
            cache = next;
            self.cache = Some(cache);
            self.cached_tokens.extend_from_slice(&input);

            let row = row_to_vec(&logits, input.len() - 1)?;
            let token = argmax(&row)
                .ok_or_else(|| Error::Model("draft model returned empty logits".to_string()))?;
            proposal.push(token);
            if proposal.len() == max_tokens {
                break;
            }
            input = vec![token];
        }

        debug!(
            reused = common,
            proposed = proposal.len(),
            "draft proposal"
        );
        Ok(proposal)
    }
}

impl Drop for DraftProposer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Proposes the tokens that followed an earlier occurrence of the history
/// suffix.
///
/// Suffix lengths are tried from `max_ngram_size` down to `min_ngram_size`;
/// for each, the earliest earlier occurrence wins.
#[derive(Debug, Clone)]
pub struct PromptLookup {
    num_speculative_tokens: usize,
    max_ngram_size: usize,
    min_ngram_size: usize,
}

impl PromptLookup {
    /// Create a lookup source.
    pub fn new(config: &SpeculativeConfig) -> Self {
        Self {
            num_speculative_tokens: config.num_speculative_tokens,
            max_ngram_size: config.max_ngram_size,
            min_ngram_size: config.min_ngram_size.max(1),
        }
    }

    /// Propose up to `max_tokens` continuations of `history`.
    pub fn propose(&self, history: &[TokenId], max_tokens: usize) -> Vec<TokenId> {
        let len = history.len();
        for n in (self.min_ngram_size..=self.max_ngram_size).rev() {
            if n >= len {
                continue;
            }
            let suffix = &history[len - n..];
            let found = (0..len - n).find(|&start| &history[start..start + n] == suffix);
            if let Some(start) = found {
                let from = start + n;
                let to = (from + max_tokens).min(len);
                return history[from..to].to_vec();
            }
        }
        Vec::new()
    }
}

fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedModel;

    fn lookup(min: usize, max: usize) -> PromptLookup {
        PromptLookup::new(&SpeculativeConfig::new(4).ngram_sizes(min, max))
    }

    #[test]
    fn test_lookup_prefers_longest_match() {
        // no 3-gram match; the bigram [2, 3] first occurs at index 1
        let history = [1, 2, 3, 4, 5, 9, 2, 3];
        assert_eq!(lookup(1, 3).propose(&history, 4), vec![4, 5, 9, 2]);
    }

    #[test]
    fn test_lookup_earliest_occurrence() {
        let history = [7, 1, 7, 2, 7];
        assert_eq!(lookup(1, 1).propose(&history, 2), vec![1, 7]);
    }

    #[test]
    fn test_lookup_no_match() {
        assert!(lookup(1, 3).propose(&[1, 2, 3], 4).is_empty());
        assert!(lookup(2, 2).propose(&[5], 4).is_empty());
    }

    #[test]
    fn test_lookup_truncates_at_history_end() {
        let history = [1, 2, 1];
        assert_eq!(lookup(1, 1).propose(&history, 5), vec![2, 1]);
    }

    #[test]
    fn test_draft_reuses_common_prefix() {
        let model = ScriptedModel::hashed(32, 3);
        let mut draft = DraftProposer::new(model, &SpeculativeConfig::new(3));

        let first = draft.propose(&[1, 2, 3], 3);
        assert_eq!(first.len(), 3);
        // prompt plus the two fed proposal tokens
        assert_eq!(draft.cached_tokens().len(), 5);

        // history diverges after [1, 2, 3, first[0]]
        let mut history = vec![1, 2, 3, first[0]];
        history.push((first[1] + 1) % 32);
        draft.propose(&history, 2);
        assert_eq!(&draft.cached_tokens()[..5], &history[..]);
    }

    #[test]
    fn test_failing_draft_degrades() {
        let model = ScriptedModel::hashed(32, 3).fail_at_call(1);
        let mut source = ProposalSource::draft(model, &SpeculativeConfig::new(3));

        assert!(source.propose(&[1, 2, 3], 3).is_empty());
        assert!(!source.is_available());
        assert!(source.propose(&[1, 2, 3], 3).is_empty());
    }

    #[test]
    fn test_proposal_bounded_by_k() {
        let mut source = ProposalSource::prompt_lookup(&SpeculativeConfig::new(2));
        let proposal = source.propose(&[1, 2, 3, 4, 1], 10);
        assert_eq!(proposal.tokens(), &[2, 3]);
    }
}
