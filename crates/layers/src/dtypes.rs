//! Precision and dtype policy utilities used throughout the workspace.
//!
//! Parameters and hidden states live in the storage dtype (`f16`/`bf16`/`f32`).
//! Matmuls run in the compute dtype, which a caller may override to mimic a
//! quantized backend's compute type. Reductions (norm statistics, softmax,
//! rotary tables, logits) always run in at least `f32`.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, widest(compute, DType::F32))
    }

    /// Builds a policy whose matmul dtype is pinned by the caller.
    ///
    /// `None` falls back to [`PrecisionPolicy::from_parameter_dtype`].
    pub fn with_compute_override(storage: DType, compute: Option<DType>) -> Self {
        match compute {
            Some(compute) => Self::new(storage, compute, widest(compute, DType::F32)),
            None => Self::from_parameter_dtype(storage),
        }
    }

    /// Returns the dtype used to store parameters and hidden states.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as norm statistics and softmax.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Policy used for the vocabulary projection: everything at least `f32`.
    pub fn for_logits(&self) -> Self {
        let wide = widest(self.reduction, DType::F32);
        Self::new(wide, widest(self.compute, wide), wide)
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn widest(a: DType, b: DType) -> DType {
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

fn rank(dtype: DType) -> u8 {
    match dtype {
        DType::F64 => 3,
        DType::F32 => 2,
        DType::F16 | DType::BF16 => 1,
        _ => 0,
    }
}
