//! Mask and position utilities shared by attention implementations.
//!
//! Masks produced here are additive tensors in the caller's working dtype,
//! shaped `[batch, 1, q_len, k_len]`. A `0` entry keeps a key position; the
//! most negative finite value of the dtype would discard it. Position ids are
//! `i64` tensors derived from the running `[batch, seq]` attention mask.

pub mod additive;
pub mod positions;

pub use additive::{build_continuation_mask, build_prefill_mask, finite_max};
pub use positions::{continuation_position_ids, prefill_position_ids};
