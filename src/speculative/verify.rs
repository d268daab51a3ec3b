//! Proposal verification.
//!
//! The target model scores the pending history tokens and the whole proposal
//! in one call. Row `first_row + i` of its logits predicts the token at
//! proposal position `i`, and one extra row follows the last proposed token:
//!
//! ```text
//! input:   [pending..., p0,  p1,  p2]
//! rows:          r0    r1   r2   r3
//! choose:        c0    c1   c2   c3      accept while c_i == p_i
//! emitted: c0 (== p0), c1 (!= p1) ──► stop, c1 is the target's own token
//! ```
//!
//! Each emitted token is chosen by the same [`Sampler`] call plain decoding
//! would make for that history, in the same order, so the output does not
//! depend on what was proposed.

use candle_core::Tensor;

use crate::engine::logits::row_to_vec;
use crate::engine::sampler::{SampledToken, Sampler};
use crate::error::Result;
use crate::model::TokenId;

/// Tokens emitted by one verification step.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// Emitted tokens, at most `proposal.len() + 1`. Empty only when the
    /// first row is exhausted.
    pub tokens: Vec<SampledToken>,
    /// Proposed tokens the target agreed with.
    pub accepted: usize,
    /// The row after the last emitted token had no selectable token.
    pub exhausted: bool,
}

/// Choose tokens from the verification rows until the first disagreement.
///
/// Stops early once `max_tokens` tokens are emitted, a stop token is
/// chosen, or a row leaves nothing to choose.
pub fn verify_proposal<F>(
    sampler: &mut Sampler,
    logits: &Tensor,
    first_row: usize,
    history: &[TokenId],
    proposal: &[TokenId],
    max_tokens: usize,
    is_stop: F,
) -> Result<Verification>
where
    F: Fn(TokenId) -> bool,
{
    let mut context = history.to_vec();
    let mut tokens = Vec::with_capacity(proposal.len() + 1);
    let mut accepted = 0;
    let mut exhausted = false;

    for i in 0..=proposal.len() {
        let row = row_to_vec(logits, first_row + i)?;
        let Some(sampled) = sampler.select(row, &context)? else {
            exhausted = true;
            break;
        };
        tokens.push(sampled);

        let matched = proposal.get(i) == Some(&sampled.token);
        if matched {
            accepted += 1;
        }
        if !matched || tokens.len() >= max_tokens || is_stop(sampled.token) {
            break;
        }
        context.push(sampled.token);
    }

    Ok(Verification {
        tokens,
        accepted,
        exhausted,
    })
}
