//! Interfaces and storage for key/value cache management.
//!
//! Attention layers use these utilities to persist projected keys and values
//! across decoding steps so each step only projects the newest token.

pub mod api;
pub mod incremental;

pub use api::KeyValueCache;
pub use incremental::IncrementalCache;
