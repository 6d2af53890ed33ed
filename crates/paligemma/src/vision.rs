//! Seam for the external vision tower.

use candle_core::{Result, Tensor};

/// Turns pixel batches into patch embeddings.
///
/// Implementations return `(batch, num_patches, hidden_size())`; the model
/// projects and splices those rows into the text sequence.
pub trait VisionEncoder: Send + Sync {
    /// Width of each patch embedding.
    fn hidden_size(&self) -> usize;

    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor>;
}
