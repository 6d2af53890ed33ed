//! Conditional generation over interleaved image and text tokens.

use std::{fmt, sync::Arc};

use attention::{IncrementalCache, KeyValueCache};
use candle_core::{DType, Device, Tensor};
use layers::PrecisionPolicy;

use crate::{
    config::PaliGemmaConfig,
    decoder::{DecoderInput, DecoderStack},
    error::ModelError,
    fusion::{merge_image_features, FusionConfig},
    loss::causal_lm_loss,
    projector::MultiModalProjector,
    vision::VisionEncoder,
};

/// Inputs of one forward call.
#[derive(Debug)]
pub struct ConditionalGenerationInput<'a> {
    /// `(batch, seq)` token ids; image slots carry the image token id.
    pub token_ids: &'a Tensor,
    /// Pixels for the vision tower. `None` splices no image features.
    pub pixel_values: Option<&'a Tensor>,
    /// Running `(batch, seen)` mask of ones and zeros.
    pub attention_mask: &'a Tensor,
    /// Cache extended in place by this call; `None` runs without caching.
    /// A failed call may leave it untouched or partially extended, never
    /// dropped.
    pub cache: Option<&'a mut IncrementalCache>,
    /// `(batch, seq)` targets; enables the loss when present.
    pub labels: Option<&'a Tensor>,
}

/// Outputs of one forward call.
#[derive(Debug)]
pub struct ConditionalGenerationOutput {
    /// `(batch, seq, vocab)` in `f32`.
    pub logits: Tensor,
    pub loss: Option<Tensor>,
}

/// Vision tower, projector and differential-attention language model.
pub struct PaliGemmaForConditionalGeneration {
    config: PaliGemmaConfig,
    vision_tower: Arc<dyn VisionEncoder>,
    multi_modal_projector: MultiModalProjector,
    language_model: DecoderStack,
    fusion: FusionConfig,
    dtype: DType,
}

impl fmt::Debug for PaliGemmaForConditionalGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaliGemmaForConditionalGeneration")
            .field("language_model", &self.language_model)
            .field("fusion", &self.fusion)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl PaliGemmaForConditionalGeneration {
    /// Builds a randomly initialised model around an external vision tower.
    pub fn new(
        config: PaliGemmaConfig,
        vision_tower: Arc<dyn VisionEncoder>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let multi_modal_projector = MultiModalProjector::new(
            config.vision_config.hidden_size,
            config.vision_config.projection_dim,
            device,
            dtype,
        )?;
        let language_model = DecoderStack::new(config.text_config.clone(), device, dtype)?;
        Self::from_parts(config, vision_tower, multi_modal_projector, language_model)
    }

    /// Assembles a model from components built elsewhere, e.g. loaded weights.
    pub fn from_parts(
        config: PaliGemmaConfig,
        vision_tower: Arc<dyn VisionEncoder>,
        multi_modal_projector: MultiModalProjector,
        language_model: DecoderStack,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let mut errors = Vec::new();
        if vision_tower.hidden_size() != config.vision_config.hidden_size {
            errors.push(format!(
                "vision tower width {} does not match vision_config.hidden_size {}",
                vision_tower.hidden_size(),
                config.vision_config.hidden_size
            ));
        }
        if language_model.config() != &config.text_config {
            errors.push("language model was built from a different text_config".to_string());
        }
        let weight = language_model.embed_tokens().weight();
        if weight.device().is_cpu() && config.compute_dtype() == Some(DType::BF16) {
            errors.push("compute_dtype bf16 has no matmul kernel on the cpu device".to_string());
        }
        if !errors.is_empty() {
            return Err(ModelError::Configuration(errors));
        }

        let dtype = weight.dtype();
        let text = &config.text_config;
        log::info!(
            "multimodal model ready: layers={} hidden={} heads={} kv_heads={} head_dim={} vocab={} image_tokens={} dtype={:?}",
            text.num_hidden_layers,
            text.hidden_size,
            text.num_attention_heads,
            text.num_key_value_heads,
            text.head_dim(),
            text.vocab_size,
            config.vision_config.num_image_tokens(),
            dtype
        );
        Ok(Self {
            fusion: FusionConfig::from_config(&config),
            config,
            vision_tower,
            multi_modal_projector,
            language_model,
            dtype,
        })
    }

    pub fn config(&self) -> &PaliGemmaConfig {
        &self.config
    }

    pub fn language_model(&self) -> &DecoderStack {
        &self.language_model
    }

    pub fn language_model_mut(&mut self) -> &mut DecoderStack {
        &mut self.language_model
    }

    pub fn multi_modal_projector(&self) -> &MultiModalProjector {
        &self.multi_modal_projector
    }

    /// An empty cache with one slot per decoder layer.
    pub fn new_cache(&self) -> IncrementalCache {
        IncrementalCache::new(self.config.text_config.num_hidden_layers)
    }

    /// Storage dtype of the weights with the configured compute override.
    pub fn default_policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::with_compute_override(self.dtype, self.config.compute_dtype())
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = self.multi_modal_projector.named_parameters();
        params.extend(
            self.language_model
                .named_parameters()
                .into_iter()
                .map(|(name, tensor)| (format!("language_model.{name}"), tensor)),
        );
        params
    }

    /// Encodes and projects pixels into `(batch, patches, hidden)` rows.
    pub fn image_features(
        &self,
        pixel_values: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, ModelError> {
        let features = self.vision_tower.encode_image(pixel_values)?;
        match features.dims() {
            [_, _, width] if *width == self.config.vision_config.hidden_size => {}
            dims => {
                return Err(ModelError::shape(format!(
                    "vision tower returned {dims:?}, expected [batch, patches, {}]",
                    self.config.vision_config.hidden_size
                )))
            }
        }
        let features = policy.cast_to_storage(&features)?;
        Ok(self.multi_modal_projector.forward(&features, policy)?)
    }

    pub fn forward(
        &self,
        input: ConditionalGenerationInput<'_>,
        policy: &PrecisionPolicy,
    ) -> Result<ConditionalGenerationOutput, ModelError> {
        let ConditionalGenerationInput {
            token_ids,
            pixel_values,
            attention_mask,
            cache,
            labels,
        } = input;
        let (batch, _) = token_ids.dims2()?;

        let mut cache = cache;
        if let Some(cache) = cache.as_deref() {
            if cache.num_layers() != self.language_model.layers().len() {
                return Err(ModelError::shape(format!(
                    "cache holds {} layers, model has {}",
                    cache.num_layers(),
                    self.language_model.layers().len()
                )));
            }
        }
        let cache_len = cache.as_deref().map_or(0, IncrementalCache::seen_len);

        let token_embeddings = self.language_model.embed(token_ids)?;
        let image_features = match pixel_values {
            Some(pixels) => {
                let features = self.image_features(pixels, policy)?;
                if features.dims()[0] != batch {
                    return Err(ModelError::shape(format!(
                        "{} images for a batch of {batch}",
                        features.dims()[0]
                    )));
                }
                Some(features)
            }
            None => None,
        };

        let fused = merge_image_features(
            image_features.as_ref(),
            &token_embeddings,
            token_ids,
            attention_mask,
            cache_len,
            &self.fusion,
        )?;

        let logits = self.language_model.forward(
            DecoderInput::Embeddings(&fused.embeddings),
            Some(&fused.attention_mask),
            &fused.position_ids,
            cache.as_deref_mut().map(|cache| cache as &mut dyn KeyValueCache),
            policy,
        )?;

        let loss = labels
            .map(|labels| causal_lm_loss(&logits, labels, self.config.ignore_index))
            .transpose()?;

        Ok(ConditionalGenerationOutput { logits, loss })
    }
}
