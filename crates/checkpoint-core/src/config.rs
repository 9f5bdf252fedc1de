//! Checkpoint configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Checkpoint directory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding the snapshots
    pub base_path: PathBuf,

    /// Snapshot file name prefix; the step is appended to it
    pub prefix: String,

    /// Retention settings
    pub retention: RetentionConfig,

    /// Allow saving at or below an existing step
    pub overwrite: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            prefix: "checkpoint_".to_string(),
            retention: RetentionConfig::default(),
            overwrite: false,
        }
    }
}

impl CheckpointConfig {
    /// Config for `base_path` with everything else defaulted
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load and validate a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: CheckpointConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration before a manager uses it
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the prefix is empty, ends in a digit, contains a
    /// path separator or starts with `.`, or if `keep_every_n_steps` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(Error::InvalidConfig {
                message: "prefix must not be empty".to_string(),
            });
        }
        // A trailing digit would make `<prefix><step>` ambiguous to parse
        if self.prefix.ends_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::InvalidConfig {
                message: format!("prefix {:?} must not end with a digit", self.prefix),
            });
        }
        if self.prefix.contains(['/', '\\']) || self.prefix.starts_with('.') {
            return Err(Error::InvalidConfig {
                message: format!("prefix {:?} must be a plain file name", self.prefix),
            });
        }
        if self.retention.keep_every_n_steps == Some(0) {
            return Err(Error::InvalidConfig {
                message: "keep_every_n_steps must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Which snapshots survive after a save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Number of recent snapshots to keep; 0 keeps all
    pub keep: usize,

    /// Snapshots at multiples of this step are never evicted
    pub keep_every_n_steps: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep: 1,
            keep_every_n_steps: None,
        }
    }
}
