//! Next-token cross entropy over model logits.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::error::ModelError;

/// Mean next-token negative log-likelihood.
///
/// `logits` are `(batch, seq, vocab)` and `labels` `(batch, seq)`. Position
/// `t` of the logits is scored against label `t + 1`; labels equal to
/// `ignore_index` are skipped. Returns an `f32` scalar, or an error when no
/// target survives the shift and the ignore filter.
pub fn causal_lm_loss(
    logits: &Tensor,
    labels: &Tensor,
    ignore_index: i64,
) -> Result<Tensor, ModelError> {
    let (batch, seq, vocab) = logits.dims3()?;
    if labels.dims() != [batch, seq] {
        return Err(ModelError::shape(format!(
            "labels must be [{batch}, {seq}], got {:?}",
            labels.dims()
        )));
    }
    if seq < 2 {
        return Err(ModelError::shape(
            "causal loss needs at least two positions per row",
        ));
    }

    let shifted = seq - 1;
    let logits = logits
        .narrow(1, 0, shifted)?
        .to_dtype(DType::F32)?
        .reshape((batch * shifted, vocab))?;
    let rows = labels.narrow(1, 1, shifted)?.to_dtype(DType::I64)?.to_vec2::<i64>()?;

    let mut targets = Vec::with_capacity(batch * shifted);
    let mut valid = Vec::with_capacity(batch * shifted);
    for &label in rows.iter().flatten() {
        if label == ignore_index {
            targets.push(0u32);
            valid.push(0f32);
        } else if label < 0 || label as usize >= vocab {
            return Err(ModelError::shape(format!(
                "label {label} outside vocabulary of size {vocab}"
            )));
        } else {
            targets.push(label as u32);
            valid.push(1f32);
        }
    }
    let total: f32 = valid.iter().sum();
    if total == 0.0 {
        return Err(ModelError::shape(
            "no labels remain after applying ignore_index",
        ));
    }

    let device = logits.device();
    let targets = Tensor::from_vec(targets, (batch * shifted, 1), device)?;
    let valid = Tensor::from_vec(valid, batch * shifted, device)?;

    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs.gather(&targets, 1)?.squeeze(1)?.neg()?;
    let loss = (nll * valid)?.sum_all()?;
    Ok(loss.affine(1.0 / f64::from(total), 0.0)?)
}
