//! End-to-end training-loop checkpointing
//!
//! Simulates a run that saves periodically, gets restarted, resumes from the
//! latest snapshot into a freshly built state, and keeps going.

use anyhow::Result;
use checkpoint::{CheckpointManager, SaveOptions};
use checkpoint_core::{
    ArrayLeaf, CheckpointConfig, Error, MeshSpec, SaveOutcome, SchemaError, ShardedArray, Tree,
};
use tempfile::TempDir;

fn train_state(step: i64, scale: f32) -> Result<Tree> {
    Ok(Tree::map([
        (
            "model",
            Tree::map([
                (
                    "dense",
                    Tree::map([
                        ("kernel", Tree::from(ArrayLeaf::from_f32(vec![2, 3], &[scale; 6])?)),
                        ("bias", Tree::from(ArrayLeaf::from_f32(vec![3], &[0.0; 3])?)),
                    ]),
                ),
            ]),
        ),
        (
            "optimizer",
            Tree::seq([
                Tree::map([("count", Tree::from(step))]),
                Tree::map([("lr", Tree::from(1e-3f64))]),
            ]),
        ),
        ("step", Tree::from(step)),
        ("run", Tree::from("resnet-small")),
    ]))
}

fn config(dir: &TempDir) -> CheckpointConfig {
    let mut config = CheckpointConfig::new(dir.path());
    config.retention.keep = 2;
    config.retention.keep_every_n_steps = Some(10);
    config
}

#[tokio::test]
async fn test_periodic_saves_and_resume() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let manager = CheckpointManager::new(config(&dir)).await?;
        for step in (0..=25).step_by(5) {
            let outcome = manager
                .save_async(train_state(step, step as f32)?, step as u64, SaveOptions::default())
                .await?;
            assert!(outcome.is_saved());
        }
        manager.wait_previous().await?;

        // Newest two plus every multiple of ten
        assert_eq!(manager.available_steps().await?, vec![0, 10, 20, 25]);
    }

    // Restarted process: build the state from scratch, then resume into it
    let manager = CheckpointManager::new(config(&dir)).await?;
    assert_eq!(manager.latest_step().await?, Some(25));

    let fresh = train_state(0, 0.0)?;
    let resumed = manager.restore(None, Some(&fresh)).await?;
    assert_eq!(resumed, train_state(25, 25.0)?);

    // The resumed run replays step 20 before reaching new territory
    let outcome = manager
        .save(&train_state(20, 20.0)?, 20, SaveOptions::default())
        .await?;
    assert_eq!(outcome, SaveOutcome::Skipped);

    manager
        .save(&train_state(30, 30.0)?, 30, SaveOptions::default())
        .await?;
    assert_eq!(manager.available_steps().await?, vec![0, 10, 20, 25, 30]);

    let older = manager.restore(Some(10), None).await?;
    assert_eq!(older.get("step"), Some(&Tree::from(10i64)));
    Ok(())
}

#[tokio::test]
async fn test_resume_into_changed_model_fails_with_path() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(config(&dir)).await?;
    manager
        .save(&train_state(5, 1.0)?, 5, SaveOptions::default())
        .await?;

    // A new head layer the checkpoint has never seen
    let mut target = train_state(0, 0.0)?;
    if let Tree::Map(root) = &mut target {
        if let Some(Tree::Map(model)) = root.get_mut("model") {
            model.insert(
                "head".to_string(),
                Tree::map([("kernel", Tree::from(ArrayLeaf::from_f32(vec![3], &[0.0; 3])?))]),
            );
        }
    }

    let err = manager.restore(None, Some(&target)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Schema(SchemaError::MissingField { ref path }) if path == "model.head"
    ));

    // Kernel reshaped for a different layout is still the same data
    let mut target = train_state(0, 0.0)?;
    if let Tree::Map(root) = &mut target {
        if let Some(Tree::Map(model)) = root.get_mut("model") {
            model.insert(
                "dense".to_string(),
                Tree::map([
                    ("kernel", Tree::from(ArrayLeaf::from_f64(vec![6], &[0.0; 6])?)),
                    ("bias", Tree::from(ArrayLeaf::from_f32(vec![3], &[0.0; 3])?)),
                ]),
            );
        }
    }
    let restored = manager.restore(None, Some(&target)).await?;
    let Some(Tree::Array(kernel)) = restored.get("model.dense.kernel") else {
        anyhow::bail!("kernel missing from restored tree");
    };
    assert_eq!(kernel.shape(), &[6]);
    assert_eq!(kernel.element(5).map(|s| s.as_f64()), Some(1.0));
    Ok(())
}

#[tokio::test]
async fn test_sharded_leaves_follow_their_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = CheckpointConfig::new(dir.path());
    config.retention.keep = 1;
    let manager = CheckpointManager::new(config).await?;

    let sharded = |step: i64| -> Result<Tree> {
        Ok(Tree::map([
            (
                "embedding",
                Tree::from(ShardedArray {
                    array: ArrayLeaf::from_f32(vec![4, 2], &[step as f32; 8])?,
                    mesh: MeshSpec::new([("data", 2)]),
                }),
            ),
            ("step", Tree::from(step)),
        ]))
    };

    manager.save(&sharded(1)?, 1, SaveOptions::default()).await?;
    assert!(dir.path().join("checkpoint_1.shards").is_dir());

    manager.save(&sharded(2)?, 2, SaveOptions::default()).await?;
    assert!(!dir.path().join("checkpoint_1").exists());
    assert!(!dir.path().join("checkpoint_1.shards").exists());

    // Restore onto a different mesh layout
    let target = Tree::map([
        (
            "embedding",
            Tree::from(ShardedArray {
                array: ArrayLeaf::from_f32(vec![8], &[0.0; 8])?,
                mesh: MeshSpec::new([("data", 4), ("model", 2)]),
            }),
        ),
        ("step", Tree::from(0i64)),
    ]);
    let restored = manager.restore(None, Some(&target)).await?;
    let Some(Tree::Sharded(embedding)) = restored.get("embedding") else {
        anyhow::bail!("embedding missing from restored tree");
    };
    assert_eq!(embedding.mesh, MeshSpec::new([("data", 4), ("model", 2)]));
    assert_eq!(embedding.array.shape(), &[8]);
    assert_eq!(embedding.array.element(0).map(|s| s.as_f64()), Some(2.0));
    Ok(())
}
