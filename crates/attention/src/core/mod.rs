//! Types shared across the attention crate.
//!
//! Kernels operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`.
//! Score matmuls run in the policy's compute dtype and the softmax always
//! accumulates in `f32`.

pub mod errors;

pub use errors::AttentionError;
