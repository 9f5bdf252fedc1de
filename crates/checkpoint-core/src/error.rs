//! Error types for tree checkpointing

use thiserror::Error;

/// Result type alias using the checkpoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Structural mismatch between restored data and a target schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("missing field {path}")]
    MissingField { path: String },

    #[error("unknown field {path}")]
    UnknownField { path: String },

    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("incompatible leaf at {path}: {reason}")]
    LeafMismatch { path: String, reason: String },
}

impl SchemaError {
    /// Dotted path of the offending node
    pub fn path(&self) -> &str {
        match self {
            SchemaError::MissingField { path }
            | SchemaError::UnknownField { path }
            | SchemaError::TypeMismatch { path, .. }
            | SchemaError::LeafMismatch { path, .. } => path,
        }
    }
}

/// Core error type for checkpoint operations
#[derive(Error, Debug)]
pub enum Error {
    // Restore errors
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("No snapshot found in {dir}{}", .step.map(|s| format!(" for step {}", s)).unwrap_or_default())]
    SnapshotNotFound { dir: String, step: Option<u64> },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    // Async save errors
    #[error("Another async save is still in flight")]
    ConcurrentSave,

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    #[error("Invalid array: {message}")]
    InvalidArray { message: String },

    #[error("Shard transport error: {message}")]
    Transport { message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if the failure may go away on a later attempt.
    ///
    /// Nothing in this workspace retries; callers decide.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Storage { .. } | Error::Transport { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentSave
                | Error::CheckpointCorrupted { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns the schema error, if this is one
    pub fn as_schema(&self) -> Option<&SchemaError> {
        match self {
            Error::Schema(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_message_names_path() {
        let err: Error = SchemaError::MissingField {
            path: "model.params.head".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Schema error: missing field model.params.head"
        );
        assert_eq!(err.as_schema().unwrap().path(), "model.params.head");
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::SnapshotNotFound {
            dir: "/ckpt".to_string(),
            step: Some(7),
        };
        assert_eq!(err.to_string(), "No snapshot found in /ckpt for step 7");

        let err = Error::SnapshotNotFound {
            dir: "/ckpt".to_string(),
            step: None,
        };
        assert_eq!(err.to_string(), "No snapshot found in /ckpt");
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::ConcurrentSave.is_fatal());
        assert!(!Error::ConcurrentSave.is_retryable());

        let err = Error::Schema(SchemaError::UnknownField {
            path: "a".to_string(),
        });
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_error_retryable() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(err.is_retryable());
    }
}
