//! Embedding crate
//!
//! Token lookup with a tied read-out head, plus rotary position encoding for
//! attention queries and keys.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;
