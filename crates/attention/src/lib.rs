//! Attention primitives for the differential-attention decoder.
//!
//! Tensors use the layout `[batch, n_heads, seq_len, head_dim]`. The crate
//! holds an append-only per-layer key/value cache for autoregressive decoding,
//! the additive mask and position-id builders used by multimodal fusion, the
//! guarded softmax weights, and the differential attention layer itself.
//!
//! Masks are additive: `0` keeps a position and the most negative finite
//! value of the working dtype discards it. Softmax reductions always run in
//! `f32`; everything else follows the [`PrecisionPolicy`](layers::PrecisionPolicy)
//! passed into each call.

pub mod core;
pub mod differential;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use crate::core::AttentionError;
pub use differential::{
    AttentionOutput, DifferentialAttention, DifferentialAttentionConfig,
    DifferentialAttentionWeights, LambdaParameters, ProjectionWeights,
};
pub use kv_cache::{IncrementalCache, KeyValueCache};
