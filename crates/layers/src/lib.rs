//! Building blocks for the decoder layers.
//!
//! Everything here consumes and produces `(batch, seq, hidden)` tensors built
//! from Candle primitives and threads an explicit [`PrecisionPolicy`] through
//! each forward call so callers decide where promotion to `f32` happens.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use dtypes::PrecisionPolicy;
