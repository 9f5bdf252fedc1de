//! Local filesystem storage backend

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Blobs stored as files below a root directory
///
/// Writes land in a hidden temp file next to the target and are renamed
/// into place after `sync_all`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Backend rooted at `root`; the directory is created on first write
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn temp_for(target: &Path) -> PathBuf {
        let name = target.file_name().unwrap_or_default().to_string_lossy();
        target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    async fn write_and_rename(temp: &Path, target: &Path, data: &[u8], path: &str) -> Result<()> {
        let mut file = fs::File::create(temp)
            .await
            .map_err(|e| Self::storage_err(path, "create temp file for", e))?;
        file.write_all(data)
            .await
            .map_err(|e| Self::storage_err(path, "write", e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::storage_err(path, "sync", e))?;
        drop(file);

        fs::rename(temp, target)
            .await
            .map_err(|e| Self::storage_err(path, "rename into", e))
    }

    fn storage_err(path: &str, action: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::StoragePathNotFound {
                path: path.to_string(),
            }
        } else {
            Error::Storage {
                message: format!("Failed to {} {}: {}", action, path, e),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.resolve(path))
            .await
            .map_err(|e| Self::storage_err(path, "read", e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.resolve(path);
        let temp = Self::temp_for(&target);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::storage_err(path, "create parent of", e))?;
        }

        // Any failure after the temp file exists removes it
        if let Err(e) = Self::write_and_rename(&temp, &target, &data, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }

        debug!(?target, size = data.len(), "Blob written");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| Self::storage_err(path, "delete", e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(path)).await.unwrap_or(false))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::storage_err(prefix, "list", e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = entry.path();
                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                let Ok(relative) = entry_path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let hidden_temp = entry.file_name().to_string_lossy().ends_with(".tmp");
                if key.starts_with(prefix) && !hidden_temp {
                    results.push(key);
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed blobs");
        Ok(results)
    }

    /// Removes the whole directory when `prefix` names one
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        let dir = self.resolve(prefix.trim_end_matches('/'));
        if prefix.ends_with('/') && fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Self::storage_err(prefix, "delete", e))?;
            return Ok(keys.len());
        }
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}
