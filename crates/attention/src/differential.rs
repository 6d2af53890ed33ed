//! Differential attention with a single softmax stream.
//!
//! A standard softmax attention map is computed once and then reduced by a
//! learned scalar: `weights' = weights - lambda_full * weights`, where
//! `lambda_full = exp(q1·k1) - exp(q2·k2) + lambda_init` and `lambda_init`
//! depends on the layer depth. The attended values are normalised per head
//! (`subln`), scaled by `1 - lambda_init`, merged and projected back to the
//! model width.
//!
//! The two-stream formulation (splitting heads and subtracting two independent
//! softmax maps) is not implemented here.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::{apply_rotary_to_qk, RopeConfig, RotaryPositionEncoder};
use layers::{
    checks,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    norm::{NormConfig, NormKind, NormalizationLayer, RmsNorm},
    PrecisionPolicy,
};

use crate::core::AttentionError;
use crate::kv_cache::KeyValueCache;
use crate::reference::softmax_weights;

/// Standard deviation used when sampling fresh lambda vectors.
const LAMBDA_INIT_STD: f32 = 0.1;

/// `lambda_init = 0.8 - 0.6 * exp(-0.3 * depth)` with `depth = max(layer_index - 1, 0)`.
pub fn lambda_init_for_layer(layer_index: usize) -> f64 {
    let depth = layer_index.saturating_sub(1) as f64;
    0.8 - 0.6 * (-0.3 * depth).exp()
}

/// Hyperparameters for one differential attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DifferentialAttentionConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
    /// Whether q/k/v/o projections carry a bias.
    pub attention_bias: bool,
    /// Epsilon of the per-head sub-layer norm.
    pub subln_eps: f64,
}

impl DifferentialAttentionConfig {
    /// Geometry-only constructor; the remaining fields take their usual defaults.
    pub fn new(hidden_size: usize, num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            num_kv_heads,
            head_dim,
            rope_theta: 10_000.0,
            max_position_embeddings: 8192,
            attention_bias: false,
            subln_eps: 1e-5,
        }
    }

    /// Fails fast on geometry the forward pass cannot honour.
    pub fn validate(&self) -> Result<(), AttentionError> {
        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
        ] {
            if value == 0 {
                return Err(AttentionError::config(format!("{name} must be non-zero")));
            }
        }
        if self.subln_eps <= 0.0 {
            return Err(AttentionError::config(format!(
                "subln_eps must be positive, got {}",
                self.subln_eps
            )));
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            return Err(AttentionError::config(format!(
                "rope_theta must be positive, got {}",
                self.rope_theta
            )));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(AttentionError::shape(format!(
                "hidden_size {} must be divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(AttentionError::shape(format!(
                "num_heads {} must be divisible by num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(AttentionError::shape(format!(
                "head_dim {} must be even for rotary encoding",
                self.head_dim
            )));
        }
        Ok(())
    }

    /// Query heads served by each key/value head.
    pub fn kv_groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

/// The four learned lambda vectors, each `(head_dim,)` in `f32`.
#[derive(Debug, Clone)]
pub struct LambdaParameters {
    pub q1: Tensor,
    pub k1: Tensor,
    pub q2: Tensor,
    pub k2: Tensor,
}

impl LambdaParameters {
    /// All-zero vectors, giving `lambda_full == lambda_init`.
    pub fn zeros(head_dim: usize, device: &Device) -> Result<Self, AttentionError> {
        let zero = Tensor::zeros(head_dim, DType::F32, device)?;
        Ok(Self {
            q1: zero.clone(),
            k1: zero.clone(),
            q2: zero.clone(),
            k2: zero,
        })
    }

    /// Vectors drawn from `N(0, std)`.
    pub fn sample(head_dim: usize, std: f32, device: &Device) -> Result<Self, AttentionError> {
        Ok(Self {
            q1: Tensor::randn(0f32, std, head_dim, device)?,
            k1: Tensor::randn(0f32, std, head_dim, device)?,
            q2: Tensor::randn(0f32, std, head_dim, device)?,
            k2: Tensor::randn(0f32, std, head_dim, device)?,
        })
    }

    fn validated(self, head_dim: usize) -> Result<Self, AttentionError> {
        let cast = |name: &str, t: Tensor| -> Result<Tensor, AttentionError> {
            checks::expect_shape(name, &t, &[head_dim])
                .map_err(|e| AttentionError::shape(e.to_string()))?;
            Ok(t.to_dtype(DType::F32)?)
        };
        Ok(Self {
            q1: cast("lambda_q1", self.q1)?,
            k1: cast("lambda_k1", self.k1)?,
            q2: cast("lambda_q2", self.q2)?,
            k2: cast("lambda_k2", self.k2)?,
        })
    }

    /// `exp(q1·k1) - exp(q2·k2) + lambda_init`, computed in `f32`.
    fn lambda_full(&self, lambda_init: f64) -> Result<f32, AttentionError> {
        let lambda_1 = (&self.q1 * &self.k1)?.sum_all()?.exp()?.to_vec0::<f32>()?;
        let lambda_2 = (&self.q2 * &self.k2)?.sum_all()?.exp()?.to_vec0::<f32>()?;
        Ok(lambda_1 - lambda_2 + lambda_init as f32)
    }
}

/// Projection weight stored `(out, in)` with an optional bias.
#[derive(Debug, Clone)]
pub struct ProjectionWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl ProjectionWeights {
    /// Bias-free projection.
    pub fn new(weight: Tensor) -> Self {
        Self { weight, bias: None }
    }
}

/// Every learned tensor of a differential attention layer.
#[derive(Debug, Clone)]
pub struct DifferentialAttentionWeights {
    pub q_proj: ProjectionWeights,
    pub k_proj: ProjectionWeights,
    pub v_proj: ProjectionWeights,
    pub o_proj: ProjectionWeights,
    pub lambdas: LambdaParameters,
    /// Scale of the per-head norm, `(head_dim,)`.
    pub subln: Tensor,
}

/// Result of a forward call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `(batch, seq, hidden)` in the storage dtype.
    pub hidden: Tensor,
    /// Reduced attention map `(batch, heads, q_len, k_len)` in the compute dtype.
    pub weights: Tensor,
}

/// One differential attention layer.
pub struct DifferentialAttention {
    layer_index: usize,
    config: DifferentialAttentionConfig,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    lambdas: LambdaParameters,
    lambda_init: f64,
    subln: RmsNorm,
    rotary: RotaryPositionEncoder,
}

impl fmt::Debug for DifferentialAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifferentialAttention")
            .field("layer_index", &self.layer_index)
            .field("heads", &self.config.num_heads)
            .field("kv_heads", &self.config.num_kv_heads)
            .field("head_dim", &self.config.head_dim)
            .field("lambda_init", &self.lambda_init)
            .finish()
    }
}

impl DifferentialAttention {
    /// Builds a layer with Xavier-uniform projections and `N(0, 0.1)` lambdas.
    pub fn new(
        layer_index: usize,
        config: DifferentialAttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let init = LinearInit::XavierUniform;
        let (q_cfg, k_cfg, v_cfg, o_cfg) = Self::projection_configs(&config);
        let q_proj = Linear::with_init(q_cfg, &init, device, dtype)?;
        let k_proj = Linear::with_init(k_cfg, &init, device, dtype)?;
        let v_proj = Linear::with_init(v_cfg, &init, device, dtype)?;
        let o_proj = Linear::with_init(o_cfg, &init, device, dtype)?;
        let lambdas = LambdaParameters::sample(config.head_dim, LAMBDA_INIT_STD, device)?;
        let subln = Tensor::ones(config.head_dim, dtype, device)?;
        Self::assemble(layer_index, config, [q_proj, k_proj, v_proj, o_proj], lambdas, subln)
    }

    /// Builds a layer from existing tensors.
    pub fn from_weights(
        layer_index: usize,
        config: DifferentialAttentionConfig,
        weights: DifferentialAttentionWeights,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let (q_cfg, k_cfg, v_cfg, o_cfg) = Self::projection_configs(&config);
        let build = |cfg: LinearConfig, w: ProjectionWeights| -> Result<Linear, AttentionError> {
            Linear::new(cfg, w.weight, w.bias).map_err(|e| AttentionError::shape(e.to_string()))
        };
        let projections = [
            build(q_cfg, weights.q_proj)?,
            build(k_cfg, weights.k_proj)?,
            build(v_cfg, weights.v_proj)?,
            build(o_cfg, weights.o_proj)?,
        ];
        Self::assemble(layer_index, config, projections, weights.lambdas, weights.subln)
    }

    fn projection_configs(
        config: &DifferentialAttentionConfig,
    ) -> (LinearConfig, LinearConfig, LinearConfig, LinearConfig) {
        let q_width = config.num_heads * config.head_dim;
        let kv_width = config.num_kv_heads * config.head_dim;
        let make = |input, output| {
            if config.attention_bias {
                LinearConfig::new(input, output)
            } else {
                LinearConfig::without_bias(input, output)
            }
        };
        (
            make(config.hidden_size, q_width),
            make(config.hidden_size, kv_width),
            make(config.hidden_size, kv_width),
            make(q_width, config.hidden_size),
        )
    }

    fn assemble(
        layer_index: usize,
        config: DifferentialAttentionConfig,
        projections: [Linear; 4],
        lambdas: LambdaParameters,
        subln_weight: Tensor,
    ) -> Result<Self, AttentionError> {
        let [q_proj, k_proj, v_proj, o_proj] = projections;
        let lambdas = lambdas.validated(config.head_dim)?;
        let subln = RmsNorm::new(
            subln_weight,
            NormConfig::new(config.head_dim, NormKind::RmsNorm).with_epsilon(config.subln_eps),
        )
        .map_err(|e| AttentionError::shape(e.to_string()))?;
        let rotary = RotaryPositionEncoder::new(
            RopeConfig {
                head_dim: config.head_dim,
                rope_theta: config.rope_theta,
                max_position_embeddings: config.max_position_embeddings,
            },
            q_proj.weight().device(),
        )?;
        let lambda_init = lambda_init_for_layer(layer_index);
        log::debug!(
            "differential attention layer {} ready: heads={} kv_heads={} head_dim={} lambda_init={:.4}",
            layer_index,
            config.num_heads,
            config.num_kv_heads,
            config.head_dim,
            lambda_init
        );
        Ok(Self {
            layer_index,
            config,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            lambdas,
            lambda_init,
            subln,
            rotary,
        })
    }

    pub fn config(&self) -> &DifferentialAttentionConfig {
        &self.config
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// Depth-dependent constant baked in at construction.
    pub fn lambda_init(&self) -> f64 {
        self.lambda_init
    }

    /// Current `lambda_full` from the learned vectors.
    pub fn lambda_full(&self) -> Result<f32, AttentionError> {
        self.lambdas.lambda_full(self.lambda_init)
    }

    /// Replaces the lambda vectors.
    pub fn set_lambdas(&mut self, lambdas: LambdaParameters) -> Result<(), AttentionError> {
        self.lambdas = lambdas.validated(self.config.head_dim)?;
        Ok(())
    }

    /// Parameters keyed the way checkpoints name them under `prefix`.
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = self.q_proj.named_parameters(&format!("{prefix}.q_proj"));
        params.extend(self.k_proj.named_parameters(&format!("{prefix}.k_proj")));
        params.extend(self.v_proj.named_parameters(&format!("{prefix}.v_proj")));
        params.extend(self.o_proj.named_parameters(&format!("{prefix}.o_proj")));
        for (name, tensor) in [
            ("lambda_q1", &self.lambdas.q1),
            ("lambda_k1", &self.lambdas.k1),
            ("lambda_q2", &self.lambdas.q2),
            ("lambda_k2", &self.lambdas.k2),
        ] {
            params.push((format!("{prefix}.{name}"), tensor.clone()));
        }
        params.push((format!("{prefix}.subln.weight"), self.subln.weight().clone()));
        params
    }

    fn expand_to_heads(&self, tensor: &Tensor, heads: usize) -> Result<Tensor, AttentionError> {
        let (batch, seq, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, seq, heads, self.config.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn merge_from_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, heads, seq, head_dim) = tensor.dims4()?;
        Ok(tensor
            .transpose(1, 2)?
            .reshape((batch, seq, heads * head_dim))?)
    }

    /// Runs the layer over `hidden` `(batch, seq, hidden_size)`.
    ///
    /// `positions` are `i64` ids shaped `(batch, seq)`; the same ids rotate
    /// queries and keys. With a cache, the new keys/values are appended under
    /// this layer's index and attention spans the full history, so `mask` must
    /// be `(batch, 1, seq, cached + seq)`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        positions: &Tensor,
        cache: Option<&mut dyn KeyValueCache>,
        policy: &PrecisionPolicy,
    ) -> Result<AttentionOutput, AttentionError> {
        checks::expect_batch_seq_hidden("attention.input", hidden, self.config.hidden_size)
            .map_err(|e| AttentionError::shape(e.to_string()))?;
        let (batch, q_len, _) = hidden.dims3()?;
        if positions.dims() != [batch, q_len] {
            return Err(AttentionError::shape(format!(
                "positions must be [{batch}, {q_len}], got {:?}",
                positions.dims()
            )));
        }

        let q = self.q_proj.forward(hidden, policy)?;
        let k = self.k_proj.forward(hidden, policy)?;
        let v = self.v_proj.forward(hidden, policy)?;
        let q = self.expand_to_heads(&q, self.config.num_heads)?;
        let k = self.expand_to_heads(&k, self.config.num_kv_heads)?;
        let v = self.expand_to_heads(&v, self.config.num_kv_heads)?;

        let q_tables = self.rotary.encode(positions, q.dtype())?;
        let k_tables = self.rotary.encode(positions, k.dtype())?;
        let (q, k) = apply_rotary_to_qk(
            &q,
            &k,
            (&q_tables.0, &q_tables.1),
            (&k_tables.0, &k_tables.1),
        )?;

        let (k, v) = match cache {
            Some(cache) => cache.update(self.layer_index, &k, &v)?,
            None => (k, v),
        };

        let groups = self.config.kv_groups();
        let k = repeat_kv(&k, groups)?;
        let v = repeat_kv(&v, groups)?;

        let weights = softmax_weights(&q, &k, mask, policy)?;
        let lambda_full = f64::from(self.lambda_full()?);
        let weights = (&weights - (&weights * lambda_full)?)?;

        let compute_policy =
            PrecisionPolicy::new(policy.compute(), policy.compute(), policy.reduction());
        let attended = weights.matmul(&policy.cast_for_matmul(&v)?.contiguous()?)?;
        let attended = self.subln.forward(&attended, &compute_policy)?;
        let attended = (attended * (1.0 - self.lambda_init))?;

        let merged = self.merge_from_heads(&attended)?;
        let hidden = self.o_proj.forward(&merged, policy)?;
        Ok(AttentionOutput { hidden, weights })
    }
}

/// Repeats each key/value head `n_rep` times along the head axis.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor, AttentionError> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, kv_heads, seq, head_dim) = x.dims4()?;
    let repeated = Tensor::cat(&vec![x; n_rep], 2)?;
    Ok(repeated.reshape((batch, kv_heads * n_rep, seq, head_dim))?)
}
