//! Versioned tree checkpoints
//!
//! Saves nested trees of arrays and scalars as numbered snapshots in one
//! directory, applies retention, runs saves in the background one at a
//! time, and restores snapshots optionally reshaped after a target tree.
//!
//! ```no_run
//! use checkpoint::{CheckpointManager, SaveOptions};
//! use checkpoint_core::{CheckpointConfig, Tree};
//!
//! # async fn example() -> checkpoint_core::Result<()> {
//! let manager = CheckpointManager::new(CheckpointConfig::new("/tmp/run")).await?;
//! let state = Tree::map([("step", Tree::from(10i64))]);
//! manager.save(&state, 10, SaveOptions::default()).await?;
//! let _restored = manager.restore(None, Some(&state)).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod coordinator;
pub mod manager;
mod reconcile;
pub mod retention;
pub mod scanner;
pub mod transport;
pub mod writer;

pub use codec::TreeCodec;
pub use coordinator::{AsyncSaveCoordinator, SaveState};
pub use manager::{CheckpointManager, CheckpointManagerHandle, SaveOptions};
pub use retention::{should_save, snapshots_superseded, snapshots_to_evict, RetentionPolicy};
pub use scanner::{list_snapshots, parse_step};
pub use transport::{ShardTransport, StorageShardTransport};
pub use writer::{read_snapshot, write_snapshot, SnapshotHeader};
