//! Differential-attention PaliGemma inference core.
//!
//! Image patches from an external [`VisionEncoder`] are projected into the
//! text embedding space, spliced into the token sequence at image-token
//! slots, and decoded by a Gemma-style stack whose layers use differential
//! attention with rotary positions and an incremental key/value cache.

pub mod config;
pub mod decoder;
pub mod error;
pub mod fusion;
pub mod loss;
pub mod model;
pub mod projector;
pub mod vision;

pub use config::{PaliGemmaConfig, TextConfig, VisionConfig};
pub use decoder::{DecoderInput, DecoderLayer, DecoderStack};
pub use error::ModelError;
pub use fusion::{merge_image_features, FusedInputs, FusionConfig};
pub use loss::causal_lm_loss;
pub use model::{
    ConditionalGenerationInput, ConditionalGenerationOutput, PaliGemmaForConditionalGeneration,
};
pub use projector::MultiModalProjector;
pub use vision::VisionEncoder;
