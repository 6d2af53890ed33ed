//! Position ids derived from a `[batch, seq]` attention mask of ones and zeros.
//!
//! The running prefix sum of the mask gives each kept token its position;
//! positions therefore start at `1` for the first attended token.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

fn mask_rows(attention_mask: &Tensor) -> Result<Vec<Vec<i64>>, AttentionError> {
    match attention_mask.dims() {
        [batch, seq] if *batch > 0 && *seq > 0 => {}
        dims => {
            return Err(AttentionError::shape(format!(
                "attention mask must be shaped [batch, seq], got {dims:?}"
            )))
        }
    }
    Ok(attention_mask.to_dtype(DType::I64)?.to_vec2::<i64>()?)
}

fn running_sum(row: &[i64]) -> Vec<i64> {
    row.iter()
        .scan(0i64, |acc, &value| {
            *acc += value;
            Some(*acc)
        })
        .collect()
}

/// Prefix sums of the mask, with masked-out positions pinned to `1`.
///
/// Returns `i64` ids shaped like the mask.
pub fn prefill_position_ids(attention_mask: &Tensor) -> Result<Tensor, AttentionError> {
    let rows = mask_rows(attention_mask)?;
    let (batch, seq) = (rows.len(), rows[0].len());
    let mut ids = Vec::with_capacity(batch * seq);
    for row in &rows {
        let sums = running_sum(row);
        ids.extend(
            row.iter()
                .zip(sums)
                .map(|(&keep, pos)| if keep == 0 { 1 } else { pos }),
        );
    }
    Ok(Tensor::from_vec(ids, (batch, seq), attention_mask.device())?)
}

/// Last column of the mask's prefix sum: the position of the next token.
///
/// Returns `i64` ids shaped `[batch, 1]`.
pub fn continuation_position_ids(attention_mask: &Tensor) -> Result<Tensor, AttentionError> {
    let rows = mask_rows(attention_mask)?;
    let batch = rows.len();
    let ids = rows.iter().map(|row| row.iter().sum::<i64>()).collect::<Vec<_>>();
    Ok(Tensor::from_vec(ids, (batch, 1), attention_mask.device())?)
}
