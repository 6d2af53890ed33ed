//! Splices projected image patches into the token-embedding sequence.
//!
//! Every position of `token_ids` is either an image slot (`image_token_id`),
//! a pad slot (`pad_token_id`, when configured) or text. Text slots keep their
//! token embedding, pad slots become zero and image slots receive the scaled
//! image feature rows in row-major order: all patches of batch row 0 first,
//! then row 1, and so on.
//!
//! Fusion also derives the additive attention mask and the rotary position
//! ids for the call. An empty cache means prefill over the whole prompt; a
//! non-empty one means a single-token continuation.

use attention::masks::{
    build_continuation_mask, build_prefill_mask, continuation_position_ids,
    prefill_position_ids,
};
use candle_core::{DType, Tensor};

use crate::{config::PaliGemmaConfig, error::ModelError};

/// Token ids and width the fusion step needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionConfig {
    pub hidden_size: usize,
    pub image_token_id: i64,
    /// Without a pad id no position is treated as padding.
    pub pad_token_id: Option<i64>,
}

impl FusionConfig {
    pub fn from_config(config: &PaliGemmaConfig) -> Self {
        Self {
            hidden_size: config.hidden_size,
            image_token_id: config.image_token_index,
            pad_token_id: config.pad_token_id,
        }
    }
}

/// Embeddings, mask and position ids ready for the decoder stack.
#[derive(Debug, Clone)]
pub struct FusedInputs {
    /// `(batch, seq, hidden)` in the token-embedding dtype.
    pub embeddings: Tensor,
    /// Additive mask `(batch, 1, q_len, k_len)`.
    pub attention_mask: Tensor,
    /// `i64` ids `(batch, q_len)`.
    pub position_ids: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Text,
    Image,
    Pad,
}

fn classify(ids: &[Vec<i64>], config: &FusionConfig) -> Vec<Slot> {
    ids.iter()
        .flatten()
        .map(|&id| {
            if id == config.image_token_id {
                Slot::Image
            } else if config.pad_token_id == Some(id) {
                Slot::Pad
            } else {
                Slot::Text
            }
        })
        .collect()
}

fn slot_mask(
    slots: &[Slot],
    wanted: Slot,
    dims: (usize, usize, usize),
    embeddings: &Tensor,
) -> Result<Tensor, ModelError> {
    let (batch, seq, hidden) = dims;
    let flags: Vec<u8> = slots.iter().map(|&slot| u8::from(slot == wanted)).collect();
    Ok(Tensor::from_vec(flags, (batch, seq, 1), embeddings.device())?
        .broadcast_as((batch, seq, hidden))?
        .contiguous()?)
}

/// Rows of `features` laid out so row `i` feeds the `i`-th image slot.
fn scatter_rows(
    features: &Tensor,
    slots: &[Slot],
    dims: (usize, usize, usize),
    config: &FusionConfig,
    dtype: DType,
) -> Result<Tensor, ModelError> {
    let (batch, seq, hidden) = dims;
    let (rows, patches, width) = features.dims3()?;
    if width != hidden {
        return Err(ModelError::shape(format!(
            "image features have width {width}, token embeddings {hidden}"
        )));
    }
    let image_slots = slots.iter().filter(|&&slot| slot == Slot::Image).count();
    if rows * patches != image_slots {
        return Err(ModelError::shape(format!(
            "{image_slots} image slots in token ids but {} image feature rows",
            rows * patches
        )));
    }

    let scale = 1.0 / (config.hidden_size as f64).sqrt();
    let flat = features
        .to_dtype(DType::F32)?
        .affine(scale, 0.0)?
        .to_dtype(dtype)?
        .reshape((rows * patches, hidden))?;

    let mut next = 0u32;
    let index: Vec<u32> = slots
        .iter()
        .map(|&slot| {
            if slot == Slot::Image {
                next += 1;
                next - 1
            } else {
                0
            }
        })
        .collect();
    let index = Tensor::from_vec(index, batch * seq, features.device())?;
    Ok(flat.index_select(&index, 0)?.reshape((batch, seq, hidden))?)
}

/// Builds the decoder inputs for one forward call.
///
/// `attention_mask` is the running `(batch, seen)` mask of ones and zeros:
/// `(batch, seq)` in prefill and `(batch, cache_len + 1)` when continuing.
/// When the token ids hold image slots, `image_features` must supply exactly
/// one row per slot; without image slots any features are ignored.
pub fn merge_image_features(
    image_features: Option<&Tensor>,
    token_embeddings: &Tensor,
    token_ids: &Tensor,
    attention_mask: &Tensor,
    cache_len: usize,
    config: &FusionConfig,
) -> Result<FusedInputs, ModelError> {
    let (batch, seq, hidden) = token_embeddings.dims3()?;
    if token_ids.dims() != [batch, seq] {
        return Err(ModelError::shape(format!(
            "token ids must be [{batch}, {seq}], got {:?}",
            token_ids.dims()
        )));
    }
    if hidden != config.hidden_size {
        return Err(ModelError::shape(format!(
            "token embeddings have width {hidden}, expected {}",
            config.hidden_size
        )));
    }

    let ids = token_ids.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let slots = classify(&ids, config);
    let dims = (batch, seq, hidden);
    let dtype = token_embeddings.dtype();
    let device = token_embeddings.device();
    let has_image_slots = slots.contains(&Slot::Image);

    let zeros = Tensor::zeros(dims, dtype, device)?;
    let text = slot_mask(&slots, Slot::Text, dims, token_embeddings)?;
    let mut embeddings = text.where_cond(token_embeddings, &zeros)?;
    match (image_features, has_image_slots) {
        (Some(features), true) => {
            let rows = scatter_rows(features, &slots, dims, config, dtype)?;
            let image = slot_mask(&slots, Slot::Image, dims, token_embeddings)?;
            embeddings = image.where_cond(&rows, &embeddings)?;
        }
        (None, true) => {
            return Err(ModelError::shape(
                "token ids contain image slots but no image features were supplied",
            ));
        }
        (_, false) => {}
    }

    let (mask, positions) = if cache_len == 0 {
        if attention_mask.dims() != [batch, seq] {
            return Err(ModelError::shape(format!(
                "prefill attention mask must be [{batch}, {seq}], got {:?}",
                attention_mask.dims()
            )));
        }
        log::debug!("prefill over {seq} positions for batch of {batch}");
        (
            build_prefill_mask(batch, seq, dtype, device)?,
            prefill_position_ids(attention_mask)?,
        )
    } else {
        // Running mask covers the cache plus the new tokens; the single-token
        // rule is enforced by the continuation mask below.
        let seen = cache_len + seq;
        if attention_mask.dims() != [batch, seen] {
            return Err(ModelError::shape(format!(
                "continuation attention mask must be [{batch}, {seen}], got {:?}",
                attention_mask.dims()
            )));
        }
        log::debug!("continuation step against {cache_len} cached positions");
        (
            build_continuation_mask(batch, seq, cache_len, dtype, device)?,
            continuation_position_ids(attention_mask)?,
        )
    };

    Ok(FusedInputs {
        embeddings,
        attention_mask: mask,
        position_ids: positions,
    })
}
