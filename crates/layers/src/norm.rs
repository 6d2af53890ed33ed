//! Root-mean-square normalisation layers with unified shape and dtype handling.
//!
//! Normalisation happens along the last axis, whatever the rank: decoder
//! layers feed `(batch, seq, hidden)` while the per-head norm inside
//! differential attention feeds `(batch, heads, seq, head_dim)`. Statistics
//! are computed in [`PrecisionPolicy::reduction`], the affine scale is applied
//! in that same dtype, and only then is the result cast back to storage.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Available normalisation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormKind {
    /// `x / rms(x) * w`, as used by the per-head sub-layer norm.
    RmsNorm,
    /// Gemma variant: `x / rms(x) * (1 + w)` with a zero-initialised `w`.
    GemmaRmsNorm,
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the axis being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the mean square.
    pub epsilon: f64,
    /// Desired variant of the normalisation routine.
    pub kind: NormKind,
}

impl NormConfig {
    /// Creates a configuration with `eps = 1e-6`.
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
            kind,
        }
    }

    /// Overrides the epsilon.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Shared interface for normalisation layers used inside decoder blocks.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation over the trailing axis.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
struct NormImpl {
    config: NormConfig,
    weight: Tensor,
}

impl NormImpl {
    fn new(config: NormConfig, weight: Tensor) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::PARAMETER_DTYPES)?;
        if config.epsilon <= 0.0 {
            return Err(Error::Msg(format!(
                "norm epsilon must be positive, got {}",
                config.epsilon
            )));
        }
        Ok(Self { config, weight })
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (mean_square + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let scale = match self.config.kind {
            NormKind::RmsNorm => weight,
            NormKind::GemmaRmsNorm => (weight + 1.0)?,
        };
        let normalized = normalized.broadcast_mul(&scale)?;

        policy.cast_to_storage(&normalized)
    }
}

/// Root mean square norm with a direct multiplicative scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

impl RmsNorm {
    /// Constructs an RMSNorm with a learnable scale.
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        Ok(Self {
            inner: NormImpl::new(config, weight)?,
        })
    }

    /// Constructs an RMSNorm whose scale starts at one.
    pub fn ones(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        Self::new(weight, config)
    }

    /// Returns the scale parameter.
    pub fn weight(&self) -> &Tensor {
        &self.inner.weight
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}

/// Gemma-style RMS norm scaling by `1 + weight`.
#[derive(Debug, Clone)]
pub struct GemmaRmsNorm {
    inner: NormImpl,
}

impl GemmaRmsNorm {
    /// Constructs the norm from a stored offset weight.
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::GemmaRmsNorm;
        Ok(Self {
            inner: NormImpl::new(config, weight)?,
        })
    }

    /// Constructs the norm with a zero offset, i.e. an effective scale of one.
    pub fn zeros(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, config)
    }

    /// Returns the stored offset weight.
    pub fn weight(&self) -> &Tensor {
        &self.inner.weight
    }
}

impl NormalizationLayer for GemmaRmsNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}
