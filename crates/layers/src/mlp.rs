//! Position-wise feed-forward blocks built on top of projections.
//!
//! MLPs operate on hidden states shaped `(batch, seq, hidden)` and return the
//! same layout. The gated variant projects the input twice to
//! `config.intermediate_size`, activates the gate branch, multiplies it with
//! the up branch, then contracts back to the model hidden size:
//! `down(gelu(gate(x)) * up(x))`, the GeGLU block used by the decoder. The
//! GeLU is the tanh approximation
//! `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`, evaluated in the
//! compute dtype. None of the projections carry a bias.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    /// Creates a gated MLP configuration.
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during block assembly.
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Weights for a [`GatedFeedForward`], each stored `(out, in)`.
#[derive(Debug, Clone)]
pub struct GatedFeedForwardWeights {
    pub gate_proj: Tensor,
    pub up_proj: Tensor,
    pub down_proj: Tensor,
}

/// Gated feed-forward block: `down(gelu_tanh(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct GatedFeedForward {
    config: FeedForwardConfig,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl GatedFeedForward {
    /// Builds the block from existing projection weights.
    pub fn new(config: FeedForwardConfig, weights: GatedFeedForwardWeights) -> Result<Self> {
        let (hidden, inner) = (config.hidden_size, config.intermediate_size);
        let gate_proj = Linear::new(LinearConfig::without_bias(hidden, inner), weights.gate_proj, None)?;
        let up_proj = Linear::new(LinearConfig::without_bias(hidden, inner), weights.up_proj, None)?;
        let down_proj = Linear::new(LinearConfig::without_bias(inner, hidden), weights.down_proj, None)?;
        Ok(Self {
            config,
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Builds the block with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (hidden, inner) = (config.hidden_size, config.intermediate_size);
        let gate_proj = Linear::with_init(LinearConfig::without_bias(hidden, inner), init, device, dtype)?;
        let up_proj = Linear::with_init(LinearConfig::without_bias(hidden, inner), init, device, dtype)?;
        let down_proj = Linear::with_init(LinearConfig::without_bias(inner, hidden), init, device, dtype)?;
        Ok(Self {
            config,
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Parameters keyed by `{prefix}.gate_proj.weight` and friends.
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = self.gate_proj.named_parameters(&format!("{prefix}.gate_proj"));
        params.extend(self.up_proj.named_parameters(&format!("{prefix}.up_proj")));
        params.extend(self.down_proj.named_parameters(&format!("{prefix}.down_proj")));
        params
    }
}

impl FeedForwardLayer for GatedFeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("mlp.input", hidden, self.config.hidden_size)?;

        // Keep the product in compute precision before contracting.
        let branch_policy =
            PrecisionPolicy::new(policy.compute(), policy.compute(), policy.reduction());
        let gate = self.gate_proj.forward(hidden, &branch_policy)?;
        let gate = gate.gelu()?;
        let up = self.up_proj.forward(hidden, &branch_policy)?;
        let fused = (gate * up)?;

        self.down_proj.forward(&fused, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn reference_geglu(input: &Tensor, weights: &GatedFeedForwardWeights) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        let flat = input.reshape((batch * seq, hidden))?;
        let gate = flat.matmul(&weights.gate_proj.t()?)?.gelu()?;
        let up = flat.matmul(&weights.up_proj.t()?)?;
        let out = (gate * up)?.matmul(&weights.down_proj.t()?)?;
        out.reshape((batch, seq, hidden))
    }

    fn sample_weights(device: &Device, hidden: usize, inner: usize) -> Result<GatedFeedForwardWeights> {
        Ok(GatedFeedForwardWeights {
            gate_proj: Tensor::randn(0f32, 0.1, (inner, hidden), device)?,
            up_proj: Tensor::randn(0f32, 0.1, (inner, hidden), device)?,
            down_proj: Tensor::randn(0f32, 0.1, (hidden, inner), device)?,
        })
    }

    #[test]
    fn geglu_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let weights = sample_weights(&device, 8, 16)?;
        let mlp = GatedFeedForward::new(
            FeedForwardConfig::new(8, 16),
            weights.clone(),
        )?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let output = mlp.forward(&input, &policy)?;
        let reference = reference_geglu(&input, &weights)?;
        let diff = output
            .sub(&reference)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5, "max diff {diff}");
        Ok(())
    }

    #[test]
    fn reduced_precision_output_stays_in_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let mlp = GatedFeedForward::with_init(
            FeedForwardConfig::new(8, 12),
            &LinearInit::XavierUniform,
            &device,
            DType::BF16,
        )?;
        let input = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?.to_dtype(DType::BF16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let output = mlp.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[1, 4, 8]);
        assert_eq!(output.dtype(), DType::BF16);
        assert_eq!(mlp.named_parameters("mlp").len(), 3);
        Ok(())
    }

    #[test]
    fn rejects_wrong_hidden_size() -> Result<()> {
        let device = Device::Cpu;
        let mlp = GatedFeedForward::with_init(
            FeedForwardConfig::new(8, 12),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let input = Tensor::zeros((1, 4, 6), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(mlp.forward(&input, &policy).is_err());
        Ok(())
    }

    #[test]
    fn gate_branch_uses_tanh_gelu() -> Result<()> {
        let device = Device::Cpu;
        // Identity projections isolate the activation: with hidden = inner = 1,
        // gate = up = down = 1 gives `gelu(x) * x`.
        let one = Tensor::ones((1, 1), DType::F32, &device)?;
        let weights = GatedFeedForwardWeights {
            gate_proj: one.clone(),
            up_proj: one.clone(),
            down_proj: one,
        };
        let mlp = GatedFeedForward::new(FeedForwardConfig::new(1, 1), weights)?;
        let values = [-2.5f32, -0.5, 0.0, 1.0, 3.0];
        let input = Tensor::from_slice(&values, (1, 5, 1), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = mlp.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;

        let coeff = (2.0 / PI).sqrt();
        for (x, y) in values.iter().zip(output.iter()) {
            let x = f64::from(*x);
            let gelu = 0.5 * x * (1.0 + (coeff * (x + 0.044715 * x.powi(3))).tanh());
            let expected = gelu * x;
            assert!((expected - f64::from(*y)).abs() < 1e-5, "{x}: {y} vs {expected}");
        }
        Ok(())
    }
}
