//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::Result;
use tracing::warn;

/// Async byte store addressed by relative, `/`-separated keys
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the blob stored under `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Store `data` under `path`, replacing any previous blob
    ///
    /// The write must never be observable half-done. Returns bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Remove the blob under `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether a blob exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every key under `prefix`, returning how many were removed
    ///
    /// Keeps going past individual failures and reports the first one at the end.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        let mut first_err = None;
        for path in self.list(prefix).await? {
            match self.delete(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete blob");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}
