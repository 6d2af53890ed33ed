//! Error type surfaced by the model-level API.

use attention::AttentionError;
use thiserror::Error;

/// Failures raised while configuring or running the multimodal model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Every violated configuration invariant, collected in one pass.
    #[error("invalid configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),
    /// The configuration file could not be deserialised.
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// Tensors handed to the model do not line up.
    #[error("shape contract violated: {0}")]
    ShapeContract(String),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl ModelError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeContract(context.into())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<toml::de::Error> for ModelError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}
