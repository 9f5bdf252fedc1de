//! Checkpoint manager: save, save-async and restore over one snapshot directory

use checkpoint_core::{
    CheckpointConfig, Error, Result, SaveOutcome, SnapshotMetadata, Step, Tree,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::LocalStorage;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::codec::TreeCodec;
use crate::coordinator::{AsyncSaveCoordinator, SaveState};
use crate::retention::{should_save, snapshots_superseded, RetentionPolicy};
use crate::scanner::{self, shard_dir_name, snapshot_path};
use crate::transport::{ShardTransport, StorageShardTransport};
use crate::writer;

/// Per-call overrides of the configured save behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Allow saving at or below an existing step
    pub overwrite: Option<bool>,

    /// Number of snapshots to keep; 0 keeps all
    pub keep: Option<usize>,
}

impl SaveOptions {
    /// Override [`CheckpointConfig::overwrite`] for this call
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = Some(overwrite);
        self
    }

    /// Override the retention count for this call
    pub fn keep(mut self, keep: usize) -> Self {
        self.keep = Some(keep);
        self
    }
}

/// Manages the snapshots of one `<base_path>/<prefix><step>` directory
///
/// Sharded leaves are stored next to the snapshots through the configured
/// [`ShardTransport`]; by default a [`StorageShardTransport`] rooted at the
/// checkpoint directory.
///
/// The manager is the single writer of its directory. Saves, async saves and
/// prunes issued through one manager (or one [`CheckpointManagerHandle`]) are
/// serialized: each one decides and writes against the directory state left
/// by the previous one.
pub struct CheckpointManager {
    config: CheckpointConfig,
    codec: TreeCodec,
    transport: Arc<dyn ShardTransport>,
    coordinator: AsyncSaveCoordinator,
    // Held from the accept/reject decision until the write is done or scheduled
    writes: Mutex<()>,
}

impl CheckpointManager {
    /// Open the checkpoint directory for writing, creating it if needed
    ///
    /// Leftover temp files from interrupted writes are removed. Use
    /// [`CheckpointManager::open_existing`] to inspect a directory another
    /// process may be writing to.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate, `Io` if the
    /// directory cannot be created or read.
    pub async fn new(config: CheckpointConfig) -> Result<Self> {
        let transport = default_transport(&config);
        Self::with_transport(config, transport).await
    }

    /// Like [`CheckpointManager::new`], with sharded leaves going through
    /// `transport`
    pub async fn with_transport(
        config: CheckpointConfig,
        transport: Arc<dyn ShardTransport>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.base_path).await?;

        for stale in scanner::stale_temp_files(&config.base_path).await? {
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => debug!(path = %stale.display(), "Removed stale temp file"),
                Err(e) => warn!(path = %stale.display(), error = %e, "Failed to remove stale temp file"),
            }
        }

        Ok(Self::assemble(config, transport))
    }

    /// Open an existing checkpoint directory without touching it
    ///
    /// Nothing is created and temp files are left alone, so this is safe to
    /// point at a directory a training run is writing to.
    ///
    /// # Errors
    ///
    /// `SnapshotNotFound` if the directory does not exist, `InvalidConfig` if
    /// the path is not a directory or the configuration does not validate.
    pub async fn open_existing(config: CheckpointConfig) -> Result<Self> {
        config.validate()?;
        match tokio::fs::metadata(&config.base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::InvalidConfig {
                    message: format!("{} is not a directory", config.base_path.display()),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SnapshotNotFound {
                    dir: config.base_path.display().to_string(),
                    step: None,
                })
            }
            Err(e) => return Err(e.into()),
        }

        let transport = default_transport(&config);
        Ok(Self::assemble(config, transport))
    }

    fn assemble(config: CheckpointConfig, transport: Arc<dyn ShardTransport>) -> Self {
        info!(
            base_path = %config.base_path.display(),
            prefix = %config.prefix,
            keep = config.retention.keep,
            "Checkpoint manager ready"
        );

        Self {
            codec: TreeCodec::with_transport(transport.clone()),
            config,
            transport,
            coordinator: AsyncSaveCoordinator::new(),
            writes: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    /// Save `tree` at `step` and apply retention
    ///
    /// Waits for any in-flight async save first.
    #[instrument(skip(self, tree), fields(base_path = %self.config.base_path.display()))]
    pub async fn save(&self, tree: &Tree, step: Step, options: SaveOptions) -> Result<SaveOutcome> {
        let _writes = self.writes.lock().await;
        self.coordinator.wait_previous().await?;

        let Some(job) = self.prepare(step, options).await? else {
            return Ok(SaveOutcome::Skipped);
        };
        job.run(tree).await.map(SaveOutcome::Saved)
    }

    /// Save `tree` at `step` on a background task
    ///
    /// The accept/reject decision is made before this returns; the write
    /// itself completes later. Failures of the previous async save surface
    /// here, and the new save is then not scheduled.
    #[instrument(skip(self, tree), fields(base_path = %self.config.base_path.display()))]
    pub async fn save_async(
        &self,
        tree: Tree,
        step: Step,
        options: SaveOptions,
    ) -> Result<SaveOutcome> {
        let _writes = self.writes.lock().await;
        // Retention must see the previous snapshot on disk
        self.coordinator.wait_previous().await?;

        let Some(job) = self.prepare(step, options).await? else {
            return Ok(SaveOutcome::Skipped);
        };
        let path = job.path.clone();
        self.coordinator
            .save_async(step, path.clone(), async move { job.run(&tree).await })
            .await?;
        Ok(SaveOutcome::Saved(path))
    }

    /// Wait for the in-flight async save, surfacing its failure
    pub async fn wait_previous(&self) -> Result<Option<PathBuf>> {
        self.coordinator.wait_previous().await
    }

    /// Whether a background save is currently running
    pub fn save_state(&self) -> SaveState {
        self.coordinator.state()
    }

    /// Restore the snapshot at `step`, or the latest one
    #[instrument(skip(self, target), fields(base_path = %self.config.base_path.display(), typed = target.is_some()))]
    pub async fn restore(&self, step: Option<Step>, target: Option<&Tree>) -> Result<Tree> {
        let path = match step {
            Some(step) => {
                let path = snapshot_path(&self.config.base_path, &self.config.prefix, step);
                if !tokio::fs::try_exists(&path).await? {
                    return Err(self.not_found(Some(step)));
                }
                path
            }
            None => {
                scanner::latest(&self.config.base_path, &self.config.prefix)
                    .await?
                    .ok_or_else(|| self.not_found(None))?
                    .1
            }
        };
        self.restore_path(&path, target).await
    }

    /// Restore a snapshot file directly
    ///
    /// Sharded leaves are looked up through this manager's transport.
    pub async fn restore_path(&self, path: &Path, target: Option<&Tree>) -> Result<Tree> {
        let (header, payload) = writer::read_snapshot(path).await?;
        let tree = self.codec.deserialize(&payload, target).await?;
        info!(step = header.step, path = %path.display(), leaves = tree.leaf_count(), "Snapshot restored");
        Ok(tree)
    }

    /// Steps of all snapshots on disk, ascending
    pub async fn available_steps(&self) -> Result<Vec<Step>> {
        Ok(self.list().await?.into_iter().map(|(s, _)| s).collect())
    }

    /// Highest step on disk, if any
    pub async fn latest_step(&self) -> Result<Option<Step>> {
        Ok(scanner::latest(&self.config.base_path, &self.config.prefix)
            .await?
            .map(|(s, _)| s))
    }

    /// Header metadata of the snapshot at `step`
    pub async fn snapshot_info(&self, step: Step) -> Result<SnapshotMetadata> {
        let path = snapshot_path(&self.config.base_path, &self.config.prefix, step);
        match writer::read_header(&path).await {
            Ok(header) => Ok(header.metadata(path)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(self.not_found(Some(step)))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `keep` to the snapshots on disk now, returning evicted steps
    pub async fn prune(&self, keep: usize) -> Result<Vec<Step>> {
        let _writes = self.writes.lock().await;
        self.coordinator.wait_previous().await?;
        let policy = RetentionPolicy {
            keep,
            ..RetentionPolicy::from(&self.config.retention)
        };
        let existing = self.list().await?;
        let evict = policy.evict(existing.iter().map(|(s, _)| *s));
        let paths = existing
            .into_iter()
            .filter(|(s, _)| evict.contains(s))
            .collect::<Vec<_>>();
        remove_snapshots(&self.config.prefix, self.transport.as_ref(), &paths).await;
        Ok(evict.into_iter().collect())
    }

    async fn list(&self) -> Result<Vec<(Step, PathBuf)>> {
        scanner::list_snapshots(&self.config.base_path, &self.config.prefix).await
    }

    /// Decide whether a save proceeds and capture what the write needs
    async fn prepare(&self, step: Step, options: SaveOptions) -> Result<Option<SaveJob>> {
        let overwrite = options.overwrite.unwrap_or(self.config.overwrite);
        let existing = self.list().await?;

        if !should_save(existing.iter().map(|(s, _)| *s), step, overwrite) {
            warn!(
                step,
                latest = existing.last().map(|(s, _)| *s),
                "Skipping save: a snapshot at or after this step exists"
            );
            return Ok(None);
        }

        let mut retention = RetentionPolicy::from(&self.config.retention);
        if let Some(keep) = options.keep {
            retention.keep = keep;
        }

        Ok(Some(SaveJob {
            base_path: self.config.base_path.clone(),
            prefix: self.config.prefix.clone(),
            path: snapshot_path(&self.config.base_path, &self.config.prefix, step),
            step,
            overwrite,
            retention,
            codec: self.codec.clone(),
            transport: self.transport.clone(),
        }))
    }

    fn not_found(&self, step: Option<Step>) -> Error {
        Error::SnapshotNotFound {
            dir: self.config.base_path.display().to_string(),
            step,
        }
    }
}

/// Everything one accepted save needs, owned so it can move to a task
struct SaveJob {
    base_path: PathBuf,
    prefix: String,
    path: PathBuf,
    step: Step,
    overwrite: bool,
    retention: RetentionPolicy,
    codec: TreeCodec,
    transport: Arc<dyn ShardTransport>,
}

impl SaveJob {
    async fn run(self, tree: &Tree) -> Result<PathBuf> {
        let payload = self
            .codec
            .serialize(tree, &shard_dir_name(&self.prefix, self.step))
            .await?;
        writer::write_snapshot(&self.path, self.step, &payload).await?;

        self.apply_retention().await;
        Ok(self.path)
    }

    /// Remove superseded and excess snapshots; failures are only logged
    async fn apply_retention(&self) {
        let existing = match scanner::list_snapshots(&self.base_path, &self.prefix).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "Skipping retention: failed to scan checkpoint directory");
                return;
            }
        };

        let superseded =
            snapshots_superseded(existing.iter().map(|(s, _)| *s), self.step, self.overwrite);
        let survivors = existing
            .iter()
            .map(|(s, _)| *s)
            .filter(|s| !superseded.contains(s));
        let evicted = self.retention.evict(survivors);

        let doomed: Vec<(Step, PathBuf)> = existing
            .into_iter()
            .filter(|(s, _)| superseded.contains(s) || evicted.contains(s))
            .collect();
        if doomed.is_empty() {
            return;
        }
        debug!(
            superseded = ?superseded,
            evicted = ?evicted,
            "Applying retention"
        );
        remove_snapshots(&self.prefix, self.transport.as_ref(), &doomed).await;
    }
}

fn default_transport(config: &CheckpointConfig) -> Arc<dyn ShardTransport> {
    Arc::new(StorageShardTransport::new(LocalStorage::new(&config.base_path)))
}

/// Best-effort deletion of snapshots and their shards
async fn remove_snapshots(prefix: &str, transport: &dyn ShardTransport, doomed: &[(Step, PathBuf)]) {
    for (step, path) in doomed {
        let removed = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => debug!(step, path = %path.display(), "Deleted old snapshot"),
            Err(e) => warn!(step, path = %path.display(), error = %e, "Failed to delete old snapshot"),
        }

        let shards = format!("{}/", shard_dir_name(prefix, *step));
        if let Err(e) = transport.remove_shards(&shards).await {
            warn!(step, error = %e, "Failed to delete shards of old snapshot");
        }
    }
}

/// Thread-safe handle to a checkpoint manager
pub type CheckpointManagerHandle = Arc<CheckpointManager>;
