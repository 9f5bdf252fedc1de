//! Storage - Pluggable byte stores for checkpoint side data
//!
//! The shard transport keeps sharded array blobs in a [`StorageBackend`].
//! Only the local filesystem backend ships here.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> checkpoint_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("checkpoint_10.shards/params.kernel", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("checkpoint_10.shards/params.kernel").await?;
//! storage.delete_prefix("checkpoint_10.shards/").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
