//! Reference softmax weights.
//!
//! Scaled dot-product scores in the compute dtype, non-finite scores zeroed,
//! additive mask, softmax in `f32`. The differential layer builds its single
//! reduced stream on top of these weights.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::PrecisionPolicy;

use crate::core::AttentionError;
use crate::masks::finite_max;

/// Plain softmax attention without learned parameters, kept as the oracle
/// the differential layer is checked against.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ExactAttention;

#[cfg(test)]
impl ExactAttention {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, AttentionError> {
        validate_qkv(q, k, v)?;
        let probs = softmax_weights(q, k, mask, policy)?;
        let v_work = policy.cast_for_matmul(v)?.contiguous()?;
        Ok(probs.matmul(&v_work)?)
    }
}

#[cfg(test)]
fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(), AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }
    for (name, tensor) in [("q", q), ("k", k), ("v", v)] {
        if !matches!(tensor.dtype(), DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{name}: {:?}", tensor.dtype()),
            });
        }
    }

    let (batch, heads, _q_len, head_dim) = q
        .dims4()
        .map_err(|_| AttentionError::shape(format!("q must be [batch, heads, seq, head_dim], got {:?}", q.dims())))?;
    let (kb, kh, k_len, kd) = k
        .dims4()
        .map_err(|_| AttentionError::shape(format!("k must be [batch, heads, seq, head_dim], got {:?}", k.dims())))?;
    let (vb, vh, vk, vd) = v
        .dims4()
        .map_err(|_| AttentionError::shape(format!("v must be [batch, heads, seq, head_dim], got {:?}", v.dims())))?;

    if kb != batch || kh != heads || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
        )));
    }
    if vb != batch || vh != heads || vk != k_len || vd != head_dim {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
        )));
    }
    Ok(())
}

fn validate_mask(mask: &Tensor, dims: (usize, usize, usize, usize)) -> Result<(), AttentionError> {
    let (batch, heads, q_len, k_len) = dims;
    let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "mask must be [batch, 1|heads, q_len, k_len], got {:?}",
            mask.dims()
        ))
    })?;
    if mb != batch || mq != q_len || mk != k_len || (mh != 1 && mh != heads) {
        return Err(AttentionError::shape(format!(
            "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
        )));
    }
    Ok(())
}

/// Attention probabilities `softmax(q·kᵀ / sqrt(head_dim) + mask)`.
///
/// Scores are computed in `policy.compute()`; NaN and infinite scores are
/// replaced with `0` before the mask is added. The softmax runs in `f32` and
/// the result is returned in the compute dtype, shaped
/// `[batch, heads, q_len, k_len]`.
pub fn softmax_weights(
    q: &Tensor,
    k: &Tensor,
    mask: Option<&Tensor>,
    policy: &PrecisionPolicy,
) -> Result<Tensor, AttentionError> {
    let (batch, heads, q_len, head_dim) = q.dims4()?;
    let k_len = k.dim(2)?;
    let compute = policy.compute();

    let q_work = policy.cast_for_matmul(q)?.contiguous()?;
    let k_work = policy.cast_for_matmul(k)?;
    let k_t = k_work.transpose(2, 3)?.contiguous()?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q_work.matmul(&k_t)? * scale)?;

    let limit = finite_max(compute)?;
    let finite = scores.abs()?.le(limit)?;
    let mut scores = finite.where_cond(&scores, &scores.zeros_like()?)?;

    if let Some(mask) = mask {
        if !q.device().same_device(mask.device()) {
            return Err(AttentionError::shape("mask must reside on the same device as q"));
        }
        validate_mask(mask, (batch, heads, q_len, k_len))?;
        scores = scores.broadcast_add(&mask.to_dtype(compute)?)?;
    }

    let probs = softmax_last_dim(&scores.to_dtype(DType::F32)?.contiguous()?)?;
    Ok(probs.to_dtype(compute)?)
}
