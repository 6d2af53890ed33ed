//! Append-only key/value cache with one slot per decoder layer.
//!
//! Slots are allocated when the cache is built for a known layer count. The
//! first update of a slot stores the tensors verbatim; later updates
//! concatenate along the sequence axis (dim 2) and hand back the whole
//! history.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::Tensor;

use crate::core::AttentionError;
use crate::kv_cache::api::KeyValueCache;

#[derive(Debug, Clone)]
struct CacheEntry {
    keys: Tensor,
    values: Tensor,
}

impl CacheEntry {
    fn seen_len(&self) -> usize {
        self.keys.dims()[2]
    }
}

/// Session-owned incremental cache.
///
/// The cache is `Send` so a session can move between threads, but not `Sync`:
/// one decoding stream owns it at a time.
#[derive(Debug)]
pub struct IncrementalCache {
    entries: Vec<Option<CacheEntry>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl IncrementalCache {
    /// Creates an empty cache with `num_layers` slots.
    pub fn new(num_layers: usize) -> Self {
        log::info!("incremental kv-cache init: layers={}", num_layers);
        Self {
            entries: vec![None; num_layers],
            _not_sync: PhantomData,
        }
    }

    /// Positions seen so far, read from the first layer.
    pub fn seen_len(&self) -> usize {
        self.size(0)
    }

    /// Whether no layer has stored anything yet.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }

    /// Drops every cached tensor, keeping the layer count.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
    }

    /// Cached `(keys, values)` per layer, `None` for untouched layers.
    pub fn entries(&self) -> Vec<Option<(Tensor, Tensor)>> {
        self.entries
            .iter()
            .map(|entry| {
                entry
                    .as_ref()
                    .map(|e| (e.keys.clone(), e.values.clone()))
            })
            .collect()
    }

    fn validate(
        &self,
        layer: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(), AttentionError> {
        if layer >= self.entries.len() {
            return Err(AttentionError::shape(format!(
                "cache layer {layer} out of range for {} layers",
                self.entries.len()
            )));
        }
        if keys.rank() != 4 || values.rank() != 4 {
            return Err(AttentionError::shape(format!(
                "cache expects [batch, kv_heads, seq, head_dim] keys/values, got {:?}/{:?}",
                keys.dims(),
                values.dims()
            )));
        }
        if keys.dims() != values.dims() {
            return Err(AttentionError::shape(format!(
                "cache keys {:?} and values {:?} disagree",
                keys.dims(),
                values.dims()
            )));
        }
        if let Some(entry) = &self.entries[layer] {
            let stored = entry.keys.dims();
            let incoming = keys.dims();
            if stored[0] != incoming[0] || stored[1] != incoming[1] || stored[3] != incoming[3] {
                return Err(AttentionError::shape(format!(
                    "cache layer {layer} holds {:?}, cannot append {:?}",
                    stored, incoming
                )));
            }
        }
        Ok(())
    }
}

impl KeyValueCache for IncrementalCache {
    fn update(
        &mut self,
        layer: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        self.validate(layer, keys, values)?;

        let entry = match self.entries[layer].take() {
            None => CacheEntry {
                keys: keys.clone(),
                values: values.clone(),
            },
            Some(existing) => CacheEntry {
                keys: Tensor::cat(&[&existing.keys, keys], 2)?,
                values: Tensor::cat(&[&existing.values, values], 2)?,
            },
        };
        log::trace!(
            "kv-cache layer {} grew to {} positions",
            layer,
            entry.seen_len()
        );
        let out = (entry.keys.clone(), entry.values.clone());
        self.entries[layer] = Some(entry);
        Ok(out)
    }

    fn size(&self, layer: usize) -> usize {
        self.entries
            .get(layer)
            .and_then(Option::as_ref)
            .map_or(0, CacheEntry::seen_len)
    }

    fn num_layers(&self) -> usize {
        self.entries.len()
    }
}
