//! Core type definitions shared across the checkpoint crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Training step a snapshot is stamped with
pub type Step = u64;

/// Snapshot metadata read back from a snapshot header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Step the snapshot was saved at
    pub step: Step,

    /// Location on disk
    pub path: PathBuf,

    /// Timestamp when the snapshot was written
    pub created_at: DateTime<Utc>,

    /// Size of the encoded tree payload in bytes
    pub payload_bytes: u64,

    /// CRC32 of the payload
    pub checksum: u32,
}

/// Outcome of a save request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Snapshot written (or scheduled, for async saves) at this path
    Saved(PathBuf),

    /// Rejected by the retention policy; nothing was written
    Skipped,
}

impl SaveOutcome {
    /// Path of the written snapshot, `None` when the save was skipped
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            SaveOutcome::Saved(p) => Some(p),
            SaveOutcome::Skipped => None,
        }
    }

    /// Whether the save went ahead
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}
