//! Snapshot naming and directory scanning
//!
//! A snapshot lives at `<dir>/<prefix><step>` where `<step>` is the canonical
//! decimal form of the step (no sign, no leading zeros). Anything else in the
//! directory, including temp files and `.shards` side directories, is ignored.

use checkpoint_core::{Result, Step};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Suffix of the side directory holding a snapshot's sharded leaves
pub const SHARD_DIR_SUFFIX: &str = ".shards";

/// Parse the step out of `name` if it is a snapshot name for `prefix`
pub fn parse_step(name: &str, prefix: &str) -> Option<Step> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// File name of the snapshot for `step`
pub fn snapshot_name(prefix: &str, step: Step) -> String {
    format!("{}{}", prefix, step)
}

/// Canonical path of the snapshot for `step`: `<dir>/<prefix><step>`
pub fn snapshot_path(dir: &Path, prefix: &str, step: Step) -> PathBuf {
    dir.join(snapshot_name(prefix, step))
}

/// Storage key prefix under which the snapshot's shards are kept
pub fn shard_dir_name(prefix: &str, step: Step) -> String {
    format!("{}{}", snapshot_name(prefix, step), SHARD_DIR_SUFFIX)
}

/// Snapshots under `dir` for `prefix`, ascending by step
///
/// An absent directory has no snapshots. Any other read failure is an error.
pub async fn list_snapshots(dir: &Path, prefix: &str) -> Result<Vec<(Step, PathBuf)>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(step) = parse_step(name, prefix) {
            found.push((step, entry.path()));
        }
    }

    found.sort_by_key(|(step, _)| *step);
    debug!(dir = %dir.display(), prefix, count = found.len(), "Scanned snapshots");
    Ok(found)
}

/// The highest-step snapshot, if any
pub async fn latest(dir: &Path, prefix: &str) -> Result<Option<(Step, PathBuf)>> {
    Ok(list_snapshots(dir, prefix).await?.pop())
}

/// Leftover temp files from interrupted writes
pub async fn stale_temp_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut stale = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(".tmp") {
            stale.push(entry.path());
        }
    }
    stale.sort();
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("checkpoint_0", "checkpoint_"), Some(0));
        assert_eq!(parse_step("checkpoint_42", "checkpoint_"), Some(42));
        assert_eq!(parse_step("checkpoint_", "checkpoint_"), None);
        assert_eq!(parse_step("checkpoint_007", "checkpoint_"), None);
        assert_eq!(parse_step("checkpoint_4.shards", "checkpoint_"), None);
        assert_eq!(parse_step("checkpoint_-1", "checkpoint_"), None);
        assert_eq!(parse_step("other_4", "checkpoint_"), None);
        assert_eq!(parse_step("checkpoint_99999999999999999999", "checkpoint_"), None);
    }

    #[test]
    fn test_names() {
        let dir = Path::new("/ckpt");
        assert_eq!(snapshot_path(dir, "step_", 12), PathBuf::from("/ckpt/step_12"));
        assert_eq!(shard_dir_name("step_", 12), "step_12.shards");
    }

    #[tokio::test]
    async fn test_absent_directory_is_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("never-created");
        assert!(list_snapshots(&missing, "checkpoint_").await.unwrap().is_empty());
        assert!(latest(&missing, "checkpoint_").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_directory_is_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(list_snapshots(&file, "checkpoint_").await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in [
            "checkpoint_10",
            "checkpoint_2",
            "checkpoint_3",
            "checkpoint_3.shards",
            ".checkpoint_4.0b1c.tmp",
            "checkpoint_abc",
            "other_1",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("checkpoint_11")).unwrap();

        let steps: Vec<_> = list_snapshots(dir.path(), "checkpoint_")
            .await
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(steps, vec![2, 3, 10, 11]);

        let (step, path) = latest(dir.path(), "checkpoint_").await.unwrap().unwrap();
        assert_eq!(step, 11);
        assert_eq!(path, dir.path().join("checkpoint_11"));
    }

    #[tokio::test]
    async fn test_stale_temp_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".checkpoint_4.abc.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("checkpoint_4"), b"x").unwrap();

        let stale = stale_temp_files(dir.path()).await.unwrap();
        assert_eq!(stale, vec![dir.path().join(".checkpoint_4.abc.tmp")]);
    }
}
