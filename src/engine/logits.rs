//! Logit processors.
//!
//! Raw model scores are adjusted in place before any token is chosen:
//!
//! ```text
//! logits row (Tensor [vocab])
//!     │
//!     ▼ row_to_vec
//! Vec<f32>
//!     │
//!     ▼ repetition penalty   (each distinct history token, once)
//!     ▼ no-repeat n-gram     (completing tokens forced to -inf)
//! processed logits ──► argmax / sampling / log_softmax for beams
//! ```

use std::collections::HashSet;

use candle_core::{DType, Device, IndexOp, Tensor, D};

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::model::TokenId;

/// Extract row `row` of a `[n, vocab]` logits tensor as `f32`.
///
/// A 1D tensor is treated as a single row.
pub fn row_to_vec(logits: &Tensor, row: usize) -> Result<Vec<f32>> {
    let row = match logits.rank() {
        1 if row == 0 => logits.clone(),
        2 => logits.i(row)?,
        rank => {
            return Err(Error::Model(format!(
                "cannot take row {row} of {rank}D logits"
            )))
        }
    };
    Ok(row.to_dtype(DType::F32)?.to_vec1()?)
}

/// Scale the logits of every distinct token in `history` by `penalty`.
///
/// Positive scores are divided and negative scores multiplied, so a penalty
/// above 1.0 always makes a seen token less likely.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[TokenId], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = HashSet::with_capacity(history.len());
    for &token in history {
        let idx = token as usize;
        if idx >= logits.len() || !seen.insert(token) {
            continue;
        }
        let score = logits[idx];
        logits[idx] = if score < 0.0 {
            score * penalty
        } else {
            score / penalty
        };
    }
}

/// Ban every token that would complete an n-gram already present in `history`.
pub fn apply_no_repeat_ngram(logits: &mut [f32], history: &[TokenId], ngram_size: usize) {
    let n = ngram_size;
    if n == 0 || history.len() + 1 < n {
        return;
    }

    let prefix = &history[history.len() + 1 - n..];
    for window in history.windows(n) {
        if &window[..n - 1] == prefix {
            let banned = window[n - 1] as usize;
            if banned < logits.len() {
                logits[banned] = f32::NEG_INFINITY;
            }
        }
    }
}

/// Apply every configured processor to a logits row.
pub fn process_logits(logits: &mut [f32], history: &[TokenId], config: &GenerationConfig) {
    apply_repetition_penalty(logits, history, config.repetition_penalty);
    apply_no_repeat_ngram(logits, history, config.ngram_block_size());
}

/// Index of the highest score, lowest index on ties.
///
/// NaN never wins. Returns `None` for an empty slice.
pub fn argmax(logits: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in logits.iter().enumerate() {
        let score = if score.is_nan() { f32::NEG_INFINITY } else { score };
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx as TokenId)
}

/// Log-probabilities of a logits row.
pub fn log_softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let t = Tensor::from_slice(logits, logits.len(), &Device::Cpu)?;
    Ok(candle_nn::ops::log_softmax(&t, D::Minus1)?.to_vec1()?)
}

/// Probabilities of a logits row.
pub fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let t = Tensor::from_slice(logits, logits.len(), &Device::Cpu)?;
    Ok(candle_nn::ops::softmax(&t, D::Minus1)?.to_vec1()?)
}
