//! Acceleration: speculative and prompt-lookup decoding.
//!
//! Both strategies guess several tokens ahead and let the target model check
//! the guess in a single call.
//!
//! ## How it works
//!
//! 1. **Propose**: a [`ProposalSource`] offers up to K tokens, either from a
//!    small draft model or by copying what followed an earlier match of the
//!    history suffix.
//!
//! 2. **Verify**: the target model processes the pending history plus all K
//!    proposed tokens in one call, yielding K+1 rows of logits.
//!
//! 3. **Accept**: proposed tokens are accepted while they equal the target's
//!    own choice; the first disagreement is replaced by the target's token.
//!
//! ## Example
//!
//! ```text
//! History:         [The, quick, brown]
//! Proposal (K=4):  [fox, jumps, over, the]
//! Target verify:   [brown, fox, jumps, over, the] -> 5 rows
//! Target choices:  [fox, jumps, under, ...]
//! Emitted:         [fox, jumps, under]           <- 2 accepted + 1 corrected
//! ```
//!
//! The emitted tokens are exactly those plain decoding would produce. A
//! source that fails or finds nothing proposes zero tokens, which is plain
//! single-token decoding.

pub mod config;
pub mod proposal;
pub mod verify;

pub use config::SpeculativeConfig;
pub use proposal::{DraftProposer, PromptLookup, Proposal, ProposalSource};
pub use verify::{verify_proposal, Verification};
