//! Integration smoke tests for the embedding crate.

use embedding::positional::rope::RopeConfig;

#[test]
fn positional_module_exposes_defaults() {
    let config = RopeConfig::default();
    assert_eq!(config.head_dim, 0);
    assert_eq!(config.rope_theta, 10_000.0);
    assert_eq!(config.max_position_embeddings, 2048);
}
