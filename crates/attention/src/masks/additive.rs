//! Builders for additive attention masks.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Largest finite value representable in `dtype`.
pub fn finite_max(dtype: DType) -> Result<f64, AttentionError> {
    match dtype {
        DType::F16 => Ok(65_504.0),
        DType::BF16 => Ok(3.389_531_389_251_535_5e38),
        DType::F32 => Ok(f64::from(f32::MAX)),
        DType::F64 => Ok(f64::MAX),
        other => Err(AttentionError::UnsupportedDType {
            requested: format!("{other:?}"),
        }),
    }
}

/// Mask for a prefill pass: every query may attend to every key.
///
/// Shaped `[batch, 1, seq_len, seq_len]`. Prefix tokens and image slots attend
/// bidirectionally, so nothing is blocked.
pub fn build_prefill_mask(
    batch: usize,
    seq_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor, AttentionError> {
    finite_max(dtype)?;
    Ok(Tensor::zeros((batch, 1, seq_len, seq_len), dtype, device)?)
}

/// Mask for a single-token continuation against `cache_len` cached positions.
///
/// Shaped `[batch, 1, 1, cache_len + 1]`. Continuation steps must carry exactly
/// one query token.
pub fn build_continuation_mask(
    batch: usize,
    q_len: usize,
    cache_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor, AttentionError> {
    if q_len != 1 {
        return Err(AttentionError::shape(format!(
            "continuation expects exactly one query token, got {q_len}"
        )));
    }
    finite_max(dtype)?;
    let k_len = cache_len + q_len;
    Ok(Tensor::zeros((batch, 1, q_len, k_len), dtype, device)?)
}
