// Cross-entropy over generated sequences with padding ignored

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Mean token cross-entropy of (L, N, V) logits against (L, N) targets,
/// skipping positions whose target is `pad_id`
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, pad_id: u32) -> Result<Tensor> {
    let vocab_size = logits.dim(D::Minus1)?;
    let logits_flat = logits.reshape(((), vocab_size))?;
    let targets_flat = targets.flatten_all()?;

    let log_probs = candle_nn::ops::log_softmax(&logits_flat, D::Minus1)?;
    let picked = log_probs
        .gather(&targets_flat.unsqueeze(1)?, 1)?
        .squeeze(1)?;

    let mask = targets_flat.ne(pad_id)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.maximum(1.0)?;
    let total = (picked * &mask)?.sum_all()?;

    Ok(total.neg()?.div(&count)?)
}
