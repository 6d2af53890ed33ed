//! Gemma-style decoder layers wrapped around differential attention.
//!
//! Each layer is pre-norm: `x + attn(norm(x))` followed by `x + mlp(norm(x))`,
//! with Gemma RMS norms (`x / rms(x) * (1 + w)`) and a GeGLU feed-forward.
//! The stack scales its input embeddings by `sqrt(hidden_size)`, runs every
//! layer against the shared mask/positions/cache, applies a final norm and
//! projects to `f32` logits.

use std::fmt;

use attention::{DifferentialAttention, DifferentialAttentionConfig, KeyValueCache};
use candle_core::{DType, Device, Tensor};
use embedding::token::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    mlp::{FeedForwardConfig, FeedForwardLayer, GatedFeedForward},
    norm::{GemmaRmsNorm, NormConfig, NormKind, NormalizationLayer},
    PrecisionPolicy,
};

use crate::{config::TextConfig, error::ModelError};

/// One pre-norm decoder layer.
pub struct DecoderLayer {
    input_layernorm: GemmaRmsNorm,
    self_attn: DifferentialAttention,
    post_attention_layernorm: GemmaRmsNorm,
    mlp: GatedFeedForward,
}

impl fmt::Debug for DecoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderLayer")
            .field("self_attn", &self.self_attn)
            .field("mlp", &self.mlp)
            .finish()
    }
}

impl DecoderLayer {
    /// Randomly initialised layer at depth `layer_index`.
    pub fn new(
        layer_index: usize,
        config: &TextConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let norm_config = NormConfig::new(config.hidden_size, NormKind::GemmaRmsNorm)
            .with_epsilon(config.rms_norm_eps);
        let self_attn =
            DifferentialAttention::new(layer_index, config.attention_config(), device, dtype)?;
        let mlp = GatedFeedForward::with_init(
            FeedForwardConfig::new(config.hidden_size, config.intermediate_size),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            input_layernorm: GemmaRmsNorm::zeros(norm_config.clone(), device, dtype)?,
            self_attn,
            post_attention_layernorm: GemmaRmsNorm::zeros(norm_config, device, dtype)?,
            mlp,
        })
    }

    /// Assembles a layer from already-built parts.
    pub fn from_parts(
        input_layernorm: GemmaRmsNorm,
        self_attn: DifferentialAttention,
        post_attention_layernorm: GemmaRmsNorm,
        mlp: GatedFeedForward,
    ) -> Self {
        Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
        }
    }

    pub fn attention(&self) -> &DifferentialAttention {
        &self.self_attn
    }

    pub fn attention_mut(&mut self) -> &mut DifferentialAttention {
        &mut self.self_attn
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = vec![(
            format!("{prefix}.input_layernorm.weight"),
            self.input_layernorm.weight().clone(),
        )];
        params.extend(self.self_attn.named_parameters(&format!("{prefix}.self_attn")));
        params.push((
            format!("{prefix}.post_attention_layernorm.weight"),
            self.post_attention_layernorm.weight().clone(),
        ));
        params.extend(self.mlp.named_parameters(&format!("{prefix}.mlp")));
        params
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        positions: &Tensor,
        cache: Option<&mut dyn KeyValueCache>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, ModelError> {
        let normed = self.input_layernorm.forward(hidden, policy)?;
        let attended = self
            .self_attn
            .forward(&normed, mask, positions, cache, policy)?;
        let hidden = (hidden + attended.hidden)?;

        let normed = self.post_attention_layernorm.forward(&hidden, policy)?;
        let projected = self.mlp.forward(&normed, policy)?;
        Ok((hidden + projected)?)
    }
}

/// What the stack receives: raw token ids or pre-computed embeddings.
#[derive(Debug, Clone, Copy)]
pub enum DecoderInput<'a> {
    /// `(batch, seq)` integer ids looked up in the embedding table.
    Tokens(&'a Tensor),
    /// `(batch, seq, hidden)` embeddings, e.g. after multimodal fusion.
    Embeddings(&'a Tensor),
}

/// Embedding table, decoder layers, final norm and language-model head.
pub struct DecoderStack {
    config: TextConfig,
    embed_tokens: TokenEmbedding,
    layers: Vec<DecoderLayer>,
    norm: GemmaRmsNorm,
    /// `None` when the head is tied to the embedding table.
    lm_head: Option<Linear>,
}

impl fmt::Debug for DecoderStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderStack")
            .field("vocab_size", &self.config.vocab_size)
            .field("hidden_size", &self.config.hidden_size)
            .field("layers", &self.layers.len())
            .field("tied_head", &self.lm_head.is_none())
            .finish()
    }
}

impl DecoderStack {
    /// Builds a randomly initialised stack.
    pub fn new(config: TextConfig, device: &Device, dtype: DType) -> Result<Self, ModelError> {
        let embed_tokens = TokenEmbedding::new(TokenEmbeddingConfig {
            vocab_size: config.vocab_size,
            hidden_dim: config.hidden_size,
            dtype,
            device: device.clone(),
        })?;
        let layers = (0..config.num_hidden_layers)
            .map(|index| DecoderLayer::new(index, &config, device, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        let norm = GemmaRmsNorm::zeros(
            NormConfig::new(config.hidden_size, NormKind::GemmaRmsNorm)
                .with_epsilon(config.rms_norm_eps),
            device,
            dtype,
        )?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(Linear::with_init(
                LinearConfig::without_bias(config.hidden_size, config.vocab_size),
                &LinearInit::XavierUniform,
                device,
                dtype,
            )?)
        };
        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    pub fn config(&self) -> &TextConfig {
        &self.config
    }

    pub fn attention_config(&self) -> DifferentialAttentionConfig {
        self.config.attention_config()
    }

    pub fn embed_tokens(&self) -> &TokenEmbedding {
        &self.embed_tokens
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [DecoderLayer] {
        &mut self.layers
    }

    /// Whether logits reuse the embedding table.
    pub fn is_tied(&self) -> bool {
        self.lm_head.is_none()
    }

    /// Looks up `(batch, seq)` ids, returning storage-dtype embeddings.
    pub fn embed(&self, token_ids: &Tensor) -> Result<Tensor, ModelError> {
        Ok(self.embed_tokens.forward(token_ids)?)
    }

    /// Parameters keyed `model.*` and `lm_head.weight` (omitted when tied).
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = self.embed_tokens.named_parameters("model.embed_tokens");
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("model.layers.{index}")));
        }
        params.push(("model.norm.weight".to_string(), self.norm.weight().clone()));
        if let Some(head) = &self.lm_head {
            params.extend(head.named_parameters("lm_head"));
        }
        params
    }

    /// Runs every layer and returns `f32` logits `(batch, seq, vocab)`.
    pub fn forward(
        &self,
        input: DecoderInput<'_>,
        mask: Option<&Tensor>,
        positions: &Tensor,
        mut cache: Option<&mut dyn KeyValueCache>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, ModelError> {
        let embeddings = match input {
            DecoderInput::Tokens(ids) => self.embed(ids)?,
            DecoderInput::Embeddings(embeddings) => embeddings.clone(),
        };
        match embeddings.dims() {
            [_, _, hidden] if *hidden == self.config.hidden_size => {}
            dims => {
                return Err(ModelError::shape(format!(
                    "decoder input must be [batch, seq, {}], got {dims:?}",
                    self.config.hidden_size
                )))
            }
        }

        // The normalizer is rounded to the embedding dtype before scaling.
        let scale = (self.config.hidden_size as f32).sqrt();
        let normalizer = Tensor::new(&[scale], embeddings.device())?.to_dtype(embeddings.dtype())?;
        let mut hidden = embeddings.broadcast_mul(&normalizer)?;

        for layer in &self.layers {
            // Each layer gets its own short reborrow of the shared cache.
            let layer_cache = cache
                .as_mut()
                .map(|cache| &mut **cache as &mut dyn KeyValueCache);
            hidden = layer.forward(&hidden, mask, positions, layer_cache, policy)?;
        }

        let hidden = self.norm.forward(&hidden, policy)?;
        let logits = match &self.lm_head {
            Some(head) => head.forward(&hidden, &policy.for_logits())?,
            None => self.embed_tokens.linear_out(&hidden)?,
        };
        Ok(logits.to_dtype(DType::F32)?)
    }
}
