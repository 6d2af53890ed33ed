//! Public traits describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Per-layer cache capable of storing projected keys and values across steps.
///
/// Keys and values are shaped `[batch, kv_heads, seq_len, head_dim]`.
pub trait KeyValueCache {
    /// Appends `keys`/`values` for `layer` and returns the full history for that layer.
    fn update(
        &mut self,
        layer: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError>;

    /// Number of cached positions for `layer`; `0` when empty or out of range.
    fn size(&self, layer: usize) -> usize;

    /// Number of layer slots the cache was sized for.
    fn num_layers(&self) -> usize;
}
