//! Background save ordering and failure propagation through a slow,
//! instrumented shard transport

use anyhow::Result;
use async_trait::async_trait;
use checkpoint::{CheckpointManager, SaveOptions, SaveState, ShardTransport};
use checkpoint_core::{
    ArrayLeaf, CheckpointConfig, Error, MeshSpec, Result as CkptResult, ShardedArray, Tree,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// In-memory transport that logs every write and can be told to fail
#[derive(Default)]
struct RecordingTransport {
    events: Mutex<Vec<String>>,
    shards: Mutex<HashMap<String, ArrayLeaf>>,
    fail_on: Mutex<Option<String>>,
    delay: Duration,
}

impl RecordingTransport {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ShardTransport for RecordingTransport {
    async fn write_shard(&self, array: &ArrayLeaf, path: &str) -> CkptResult<()> {
        self.events.lock().push(format!("start {}", path));
        tokio::time::sleep(self.delay).await;

        let failing = self.fail_on.lock().as_deref().is_some_and(|p| path.starts_with(p));
        if failing {
            self.events.lock().push(format!("fail {}", path));
            return Err(Error::Transport {
                message: format!("injected failure for {}", path),
            });
        }

        self.shards.lock().insert(path.to_string(), array.clone());
        self.events.lock().push(format!("end {}", path));
        Ok(())
    }

    async fn read_shard(&self, path: &str, _mesh: &MeshSpec) -> CkptResult<ArrayLeaf> {
        self.shards
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn remove_shards(&self, prefix: &str) -> CkptResult<()> {
        self.shards.lock().retain(|k, _| !k.starts_with(prefix));
        self.events.lock().push(format!("remove {}", prefix));
        Ok(())
    }
}

fn sharded_state(step: u64) -> Result<Tree> {
    Ok(Tree::map([
        (
            "w",
            Tree::from(ShardedArray {
                array: ArrayLeaf::from_f32(vec![4], &[step as f32; 4])?,
                mesh: MeshSpec::new([("data", 2)]),
            }),
        ),
        ("step", Tree::from(step as i64)),
    ]))
}

async fn setup(
    keep: usize,
    delay: Duration,
) -> Result<(TempDir, Arc<RecordingTransport>, CheckpointManager)> {
    let dir = TempDir::new()?;
    let transport = Arc::new(RecordingTransport::slow(delay));
    let mut config = CheckpointConfig::new(dir.path());
    config.retention.keep = keep;
    let manager = CheckpointManager::with_transport(config, transport.clone()).await?;
    Ok((dir, transport, manager))
}

#[tokio::test]
async fn test_second_save_starts_after_first_completes() -> Result<()> {
    let (_dir, transport, manager) = setup(0, Duration::from_millis(50)).await?;

    manager.save_async(sharded_state(1)?, 1, SaveOptions::default()).await?;
    assert_eq!(manager.save_state(), SaveState::Saving);
    manager.save_async(sharded_state(2)?, 2, SaveOptions::default()).await?;
    manager.wait_previous().await?;

    assert_eq!(
        transport.events(),
        vec![
            "start checkpoint_1.shards/0",
            "end checkpoint_1.shards/0",
            "start checkpoint_2.shards/0",
            "end checkpoint_2.shards/0",
        ]
    );
    assert_eq!(manager.save_state(), SaveState::Idle);

    let restored = manager.restore(Some(1), None).await?;
    assert_eq!(restored, sharded_state(1)?);
    Ok(())
}

#[tokio::test]
async fn test_failed_async_save_surfaces_and_blocks_next() -> Result<()> {
    let (dir, transport, manager) = setup(0, Duration::from_millis(10)).await?;
    *transport.fail_on.lock() = Some("checkpoint_1.shards/".to_string());

    let outcome = manager.save_async(sharded_state(1)?, 1, SaveOptions::default()).await?;
    assert!(outcome.is_saved());

    let err = manager
        .save_async(sharded_state(2)?, 2, SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
    assert!(err.is_retryable());

    // Neither snapshot made it to disk and step 2 was never started
    assert!(manager.available_steps().await?.is_empty());
    assert!(!dir.path().join("checkpoint_1").exists());
    assert!(!transport
        .events()
        .iter()
        .any(|e| e.contains("checkpoint_2")));

    // The error is reported once; the caller can retry
    *transport.fail_on.lock() = None;
    manager.save_async(sharded_state(2)?, 2, SaveOptions::default()).await?;
    assert_eq!(manager.wait_previous().await?, Some(dir.path().join("checkpoint_2")));
    Ok(())
}

#[tokio::test]
async fn test_eviction_removes_shards_through_transport() -> Result<()> {
    let (_dir, transport, manager) = setup(1, Duration::ZERO).await?;

    for step in 1..=3 {
        manager.save(&sharded_state(step)?, step, SaveOptions::default()).await?;
    }

    let events = transport.events();
    assert!(events.contains(&"remove checkpoint_1.shards/".to_string()));
    assert!(events.contains(&"remove checkpoint_2.shards/".to_string()));
    assert_eq!(transport.shards.lock().len(), 1);
    assert_eq!(manager.available_steps().await?, vec![3]);
    Ok(())
}
