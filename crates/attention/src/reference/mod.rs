//! Portable, exact softmax attention weights.
//!
//! These paths favour clarity over absolute performance and serve as the
//! baseline the differential layer builds on.

pub mod exact;

pub use exact::softmax_weights;
