//! Lightweight validation helpers shared across layer components.
//!
//! Each helper takes the parameter or activation name first so failures read
//! like `q_proj.weight: expected shape [8, 8], got [8, 4]`. They return
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the given rank.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures the trailing axis has the requested size.
pub fn expect_last_dim(name: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name}: expected trailing dim {size}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden && *batch > 0 && *seq > 0 => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Floating dtypes accepted for parameters.
pub const PARAMETER_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];
