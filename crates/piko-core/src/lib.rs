//! piko-core — shared types, the discovery wire format, key handling, and
//! the persisted node configuration. All other pikonet crates depend on
//! this one.

pub mod config;
pub mod keys;
pub mod model;
pub mod wire;

pub use keys::{KeyPair, WgKey};
pub use model::{Device, Network};
