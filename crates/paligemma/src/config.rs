//! Typed configuration for the multimodal model.
//!
//! Checkpoint configs nest a text and a vision section under a top-level
//! object. Optional keys fall back to the defaults documented on each field.
//! [`PaliGemmaConfig::from_path`] accepts `.json` and `.toml` files and
//! validates the combined geometry before returning.

use std::{fs, path::Path};

use attention::DifferentialAttentionConfig;
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Geometry of the causal language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    /// Per-head width; `hidden_size / num_attention_heads` when absent.
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub attention_bias: bool,
    /// Accepted for checkpoint compatibility; inference never drops weights.
    #[serde(default)]
    pub attention_dropout: f32,
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

impl TextConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Attention hyperparameters shared by every decoder layer.
    pub fn attention_config(&self) -> DifferentialAttentionConfig {
        let mut config = DifferentialAttentionConfig::new(
            self.hidden_size,
            self.num_attention_heads,
            self.num_key_value_heads,
            self.head_dim(),
        );
        config.rope_theta = self.rope_theta;
        config.max_position_embeddings = self.max_position_embeddings;
        config.attention_bias = self.attention_bias;
        config
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
        ] {
            if value == 0 {
                errors.push(format!("text_config.{name} must be greater than 0"));
            }
        }
        if self.num_attention_heads > 0 && self.hidden_size % self.num_attention_heads != 0 {
            errors.push(format!(
                "text_config.hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            ));
        }
        if self.num_key_value_heads > 0 && self.num_attention_heads % self.num_key_value_heads != 0 {
            errors.push(format!(
                "text_config.num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            ));
        }
        let head_dim = self.head_dim();
        if head_dim == 0 || head_dim % 2 != 0 {
            errors.push(format!(
                "text_config.head_dim must be a positive even number, got {head_dim}"
            ));
        }
        if self.rms_norm_eps <= 0.0 {
            errors.push("text_config.rms_norm_eps must be greater than 0".to_string());
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            errors.push("text_config.rope_theta must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.attention_dropout) {
            errors.push("text_config.attention_dropout must be in [0, 1)".to_string());
        }
    }
}

/// The slice of the vision tower's configuration the fusion step depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    pub hidden_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    /// Output width of the multimodal projector.
    pub projection_dim: usize,
    /// `(image_size / patch_size)^2` when absent.
    #[serde(default)]
    pub num_image_tokens: Option<usize>,
}

impl VisionConfig {
    pub fn num_image_tokens(&self) -> usize {
        self.num_image_tokens.unwrap_or_else(|| {
            let per_side = self.image_size / self.patch_size.max(1);
            per_side * per_side
        })
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("image_size", self.image_size),
            ("patch_size", self.patch_size),
            ("projection_dim", self.projection_dim),
        ] {
            if value == 0 {
                errors.push(format!("vision_config.{name} must be greater than 0"));
            }
        }
        if self.patch_size > self.image_size {
            errors.push(format!(
                "vision_config.patch_size ({}) must not exceed image_size ({})",
                self.patch_size, self.image_size
            ));
        }
    }
}

/// Top-level configuration of the vision-language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaliGemmaConfig {
    pub text_config: TextConfig,
    pub vision_config: VisionConfig,
    /// Token id marking a slot that receives one image patch embedding.
    #[serde(default = "default_image_token_index")]
    pub image_token_index: i64,
    /// Token id whose embeddings are zeroed during fusion.
    #[serde(default)]
    pub pad_token_id: Option<i64>,
    /// Label value excluded from the language-modelling loss.
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub projection_dim: usize,
    /// Optional matmul dtype override: `f32`, `f16` or `bf16`.
    #[serde(default)]
    pub compute_dtype: Option<String>,
}

impl PaliGemmaConfig {
    /// Loads a JSON or TOML file (by extension) and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: PaliGemmaConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates an in-memory JSON document.
    pub fn from_json_str(contents: &str) -> Result<Self, ModelError> {
        let config: PaliGemmaConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every invariant and reports all violations together.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut errors = Vec::new();
        self.text_config.collect_errors(&mut errors);
        self.vision_config.collect_errors(&mut errors);

        if self.hidden_size != self.text_config.hidden_size {
            errors.push(format!(
                "hidden_size ({}) must match text_config.hidden_size ({})",
                self.hidden_size, self.text_config.hidden_size
            ));
        }
        if self.vocab_size != self.text_config.vocab_size {
            errors.push(format!(
                "vocab_size ({}) must match text_config.vocab_size ({})",
                self.vocab_size, self.text_config.vocab_size
            ));
        }
        if self.projection_dim != self.vision_config.projection_dim {
            errors.push(format!(
                "projection_dim ({}) must match vision_config.projection_dim ({})",
                self.projection_dim, self.vision_config.projection_dim
            ));
        }
        if self.projection_dim != self.text_config.hidden_size {
            errors.push(format!(
                "projection_dim ({}) must equal the text hidden size ({}) so image features can be spliced",
                self.projection_dim, self.text_config.hidden_size
            ));
        }
        if self.image_token_index < 0 || self.image_token_index as usize >= self.text_config.vocab_size {
            errors.push(format!(
                "image_token_index ({}) must be a valid token id below {}",
                self.image_token_index, self.text_config.vocab_size
            ));
        }
        if self.pad_token_id == Some(self.image_token_index) {
            errors.push("pad_token_id must differ from image_token_index".to_string());
        }
        if let Some(name) = &self.compute_dtype {
            if parse_dtype(name).is_none() {
                errors.push(format!(
                    "compute_dtype '{name}' is not one of f32, f16, bf16"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Configuration(errors))
        }
    }

    /// Matmul dtype requested by the config, if any.
    pub fn compute_dtype(&self) -> Option<DType> {
        self.compute_dtype.as_deref().and_then(parse_dtype)
    }
}

/// Parses the dtype names used by checkpoint configs.
pub fn parse_dtype(name: &str) -> Option<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Some(DType::F32),
        "f16" | "float16" => Some(DType::F16),
        "bf16" | "bfloat16" => Some(DType::BF16),
        _ => None,
    }
}

fn default_max_position_embeddings() -> usize {
    8192
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_tie_word_embeddings() -> bool {
    true
}

fn default_image_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    14
}

fn default_image_token_index() -> i64 {
    256_000
}

fn default_ignore_index() -> i64 {
    -100
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = r#"{
        "text_config": {
            "vocab_size": 32,
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "num_key_value_heads": 1
        },
        "vision_config": { "hidden_size": 6, "projection_dim": 8, "image_size": 28 },
        "image_token_index": 31,
        "vocab_size": 32,
        "hidden_size": 8,
        "projection_dim": 8
    }"#;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = PaliGemmaConfig::from_json_str(TINY).expect("valid config");
        let text = &config.text_config;
        assert_eq!(text.head_dim(), 4);
        assert_eq!(text.max_position_embeddings, 8192);
        assert!((text.rms_norm_eps - 1e-6).abs() < 1e-12);
        assert_eq!(text.rope_theta, 10_000.0);
        assert!(text.tie_word_embeddings);
        assert!(!text.attention_bias);
        assert_eq!(config.vision_config.patch_size, 14);
        assert_eq!(config.vision_config.num_image_tokens(), 4);
        assert_eq!(config.ignore_index, -100);
        assert_eq!(config.pad_token_id, None);
        assert_eq!(config.compute_dtype(), None);
    }

    #[test]
    fn attention_config_mirrors_text_geometry() {
        let config = PaliGemmaConfig::from_json_str(TINY).expect("valid config");
        let attention = config.text_config.attention_config();
        assert_eq!(attention.hidden_size, 8);
        assert_eq!(attention.num_heads, 2);
        assert_eq!(attention.num_kv_heads, 1);
        assert_eq!(attention.head_dim, 4);
        assert_eq!(attention.kv_groups(), 2);
        assert!(attention.validate().is_ok());
    }

    #[test]
    fn validation_reports_every_violation() {
        let mut config = PaliGemmaConfig::from_json_str(TINY).expect("valid config");
        config.text_config.num_attention_heads = 3;
        config.projection_dim = 6;
        config.compute_dtype = Some("int8".into());
        match config.validate() {
            Err(ModelError::Configuration(errors)) => {
                assert!(errors.iter().any(|e| e.contains("num_attention_heads")));
                assert!(errors.iter().any(|e| e.contains("projection_dim")));
                assert!(errors.iter().any(|e| e.contains("compute_dtype")));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn parses_dtype_aliases() {
        assert_eq!(parse_dtype("bfloat16"), Some(DType::BF16));
        assert_eq!(parse_dtype("F16"), Some(DType::F16));
        assert_eq!(parse_dtype("float32"), Some(DType::F32));
        assert_eq!(parse_dtype("int4"), None);
    }
}
