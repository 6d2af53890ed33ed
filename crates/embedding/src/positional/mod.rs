//! Positional encodings applied to attention queries and keys.

pub mod rope;

pub use rope::{apply_rotary, apply_rotary_to_qk, rotate_half, RopeConfig, RotaryPositionEncoder};
