//! Checkpoint Core - Foundation for versioned tree checkpoints
//!
//! Provides the tree data model, error handling and configuration
//! shared by the storage and checkpoint crates.

pub mod config;
pub mod error;
pub mod tree;
pub mod types;

pub use config::{CheckpointConfig, RetentionConfig};
pub use error::{Error, Result, SchemaError};
pub use tree::{element_count, join_path, ArrayLeaf, DType, MeshSpec, Scalar, ShardedArray, Tree};
pub use types::*;
