//! Shard transport: where sharded array leaves go instead of the snapshot file

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::{ArrayLeaf, Error, MeshSpec, Result};
use storage::StorageBackend;
use tracing::{debug, instrument};

/// Collaborator that persists sharded array leaves
///
/// The serializer hands every sharded leaf to `write_shard` during a save and
/// fetches it back with `read_shard` during restore, passing the mesh the
/// caller wants the array laid out over.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Persist `array` under `path`, replacing any previous shard there
    ///
    /// # Errors
    ///
    /// Any storage failure; the save that requested the write fails with it.
    async fn write_shard(&self, array: &ArrayLeaf, path: &str) -> Result<()>;

    /// Fetch the shard at `path`, laid out over `mesh`
    ///
    /// # Errors
    ///
    /// `StoragePathNotFound` for an unknown path, `Transport` if `mesh`
    /// cannot hold the array.
    async fn read_shard(&self, path: &str, mesh: &MeshSpec) -> Result<ArrayLeaf>;

    /// Drop every shard stored under `prefix`
    async fn remove_shards(&self, prefix: &str) -> Result<()>;
}

/// Single-host transport that keeps whole arrays in a [`StorageBackend`]
///
/// Each shard is a `bincode` encoded [`ArrayLeaf`]; the mesh only gets
/// validated, since every process reads the full array back.
#[derive(Debug, Clone)]
pub struct StorageShardTransport<B> {
    backend: B,
}

impl<B: StorageBackend> StorageShardTransport<B> {
    /// Store shards in `backend`, keyed by their transport path
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: StorageBackend> ShardTransport for StorageShardTransport<B> {
    #[instrument(skip(self, array), fields(dtype = %array.dtype(), bytes = array.data().len()))]
    async fn write_shard(&self, array: &ArrayLeaf, path: &str) -> Result<()> {
        let blob = bincode::serialize(array)?;
        self.backend.write(path, Bytes::from(blob)).await?;
        debug!(path, "Shard written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_shard(&self, path: &str, mesh: &MeshSpec) -> Result<ArrayLeaf> {
        if mesh.axes.iter().any(|(_, size)| *size == 0) {
            return Err(Error::Transport {
                message: format!("mesh for {} has an empty axis: {:?}", path, mesh.axes),
            });
        }
        let blob = self.backend.read(path).await?;
        // Decoding validates the buffer against the recorded shape
        Ok(bincode::deserialize(&blob)?)
    }

    async fn remove_shards(&self, prefix: &str) -> Result<()> {
        let removed = self.backend.delete_prefix(prefix).await?;
        if removed > 0 {
            debug!(prefix, removed, "Shards removed");
        }
        Ok(())
    }
}
