//! Rotary positional embeddings in the half-split layout.
//!
//! The head dimension is treated as two halves `[x1, x2]`; each pair
//! `(x1[i], x2[i])` is rotated by `position * inv_freq[i]`. Tables are built
//! per call from explicit position ids shaped `(batch, seq)`, so queries and
//! keys may be rotated with different position streams.

use candle_core::{bail, DType, Device, Result, Tensor, D};

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// Longest position the model was trained for.
    pub max_position_embeddings: usize,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            max_position_embeddings: 2048,
        }
    }
}

/// Produces cosine/sine tables for explicit position ids.
#[derive(Debug, Clone)]
pub struct RotaryPositionEncoder {
    config: RopeConfig,
    inv_freq: Tensor,
}

impl RotaryPositionEncoder {
    /// Validates the configuration and precomputes `inv_freq[i] = θ^(-2i/head_dim)`.
    pub fn new(config: RopeConfig, device: &Device) -> Result<Self> {
        if config.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        if config.head_dim % 2 != 0 {
            bail!("head_dim must be even to pair dimensions, got {}", config.head_dim);
        }
        if config.rope_theta.is_nan() || config.rope_theta <= 0.0 {
            bail!("rope_theta must be positive, got {}", config.rope_theta);
        }

        let half_dim = config.head_dim / 2;
        let base = config.rope_theta as f64;
        let mut inv_freqs = Vec::with_capacity(half_dim);
        for idx in 0..half_dim {
            let exponent = (2 * idx) as f64 / config.head_dim as f64;
            inv_freqs.push(base.powf(-exponent) as f32);
        }
        let inv_freq = Tensor::from_vec(inv_freqs, (1, 1, half_dim), device)?;

        log::debug!(
            "rotary encoder ready: head_dim={} theta={} max_positions={}",
            config.head_dim,
            config.rope_theta,
            config.max_position_embeddings
        );
        Ok(Self { config, inv_freq })
    }

    /// Returns the configuration used to build the frequency table.
    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Builds `(cos, sin)` tables shaped `(batch, seq, head_dim)` for `positions`.
    ///
    /// Angles are computed in `f32` and only the final tables are cast to `dtype`.
    pub fn encode(&self, positions: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (batch, seq) = match positions.dims() {
            [batch, seq] => (*batch, *seq),
            dims => bail!("positions must be shaped [batch, seq], got {:?}", dims),
        };
        if !positions.dtype().is_int() {
            bail!("positions expected integer dtype but received {:?}", positions.dtype());
        }

        let positions = positions
            .to_dtype(DType::F32)?
            .to_device(self.inv_freq.device())?
            .reshape((batch, seq, 1))?;
        let freqs = positions.broadcast_mul(&self.inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        let cos = emb.cos()?.to_dtype(dtype)?;
        let sin = emb.sin()?.to_dtype(dtype)?;
        Ok((cos, sin))
    }
}

/// Rotates half the trailing features: `[x1, x2] -> [-x2, x1]`.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.dim(D::Minus1)?;
    if last % 2 != 0 {
        bail!("rotate_half expects an even trailing dim, got {}", last);
    }
    let half = last / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

/// Applies `x * cos + rotate_half(x) * sin`.
///
/// `x` is `(batch, heads, seq, head_dim)` and the tables are
/// `(batch, seq, head_dim)`; they are unsqueezed on the head axis and cast to
/// the dtype of `x`.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (batch, _heads, seq, head_dim) = x.dims4()?;
    let (cb, cs, cd) = cos.dims3()?;
    if (cb, cs, cd) != (batch, seq, head_dim) || sin.dims() != cos.dims() {
        bail!(
            "rotary tables {:?}/{:?} do not match input {:?}",
            cos.dims(),
            sin.dims(),
            x.dims()
        );
    }
    let cos = cos.to_dtype(x.dtype())?.unsqueeze(1)?;
    let sin = sin.to_dtype(x.dtype())?.unsqueeze(1)?;
    let rotated = rotate_half(x)?;
    x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
}

/// Rotates queries and keys with their own `(cos, sin)` tables.
pub fn apply_rotary_to_qk(
    q: &Tensor,
    k: &Tensor,
    q_tables: (&Tensor, &Tensor),
    k_tables: (&Tensor, &Tensor),
) -> Result<(Tensor, Tensor)> {
    if !q.device().same_device(k.device()) {
        bail!("query and key must live on the same device");
    }
    let q_rot = apply_rotary(q, q_tables.0, q_tables.1)?;
    let k_rot = apply_rotary(k, k_tables.0, k_tables.1)?;
    Ok((q_rot, k_rot))
}
