//! Retention policy: which saves proceed and which snapshots get evicted

use checkpoint_core::{RetentionConfig, Step};
use std::collections::BTreeSet;

/// Whether a save at `new_step` may proceed
///
/// Without `overwrite`, any existing step at or above `new_step` rejects the
/// save so a resumed run cannot silently regress the checkpoint stream.
pub fn should_save(
    existing_steps: impl IntoIterator<Item = Step>,
    new_step: Step,
    overwrite: bool,
) -> bool {
    overwrite || existing_steps.into_iter().all(|s| s < new_step)
}

/// Oldest snapshots beyond the newest `keep`; `keep == 0` keeps everything
pub fn snapshots_to_evict(
    existing_steps_after_save: impl IntoIterator<Item = Step>,
    keep: usize,
) -> BTreeSet<Step> {
    RetentionPolicy {
        keep,
        keep_every_n_steps: None,
    }
    .evict(existing_steps_after_save)
}

/// Snapshots newer than an overwriting save, which it replaces
pub fn snapshots_superseded(
    existing_steps: impl IntoIterator<Item = Step>,
    new_step: Step,
    overwrite: bool,
) -> BTreeSet<Step> {
    if !overwrite {
        return BTreeSet::new();
    }
    existing_steps.into_iter().filter(|s| *s > new_step).collect()
}

/// Eviction knobs applied after every successful save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    /// Number of newest snapshots to keep; 0 keeps all
    pub keep: usize,

    /// Older snapshots at multiples of this step survive as well
    pub keep_every_n_steps: Option<u64>,
}

impl RetentionPolicy {
    /// Steps to delete from `existing`
    ///
    /// # Arguments
    ///
    /// * `existing` - steps on disk after the latest save, in any order
    ///
    /// Only the oldest snapshots beyond `keep` are candidates; candidates at
    /// a multiple of `keep_every_n_steps` are spared.
    pub fn evict(&self, existing: impl IntoIterator<Item = Step>) -> BTreeSet<Step> {
        if self.keep == 0 {
            return BTreeSet::new();
        }
        let steps: BTreeSet<Step> = existing.into_iter().collect();
        let excess = steps.len().saturating_sub(self.keep);
        steps
            .into_iter()
            .take(excess)
            .filter(|s| !self.is_pinned(*s))
            .collect()
    }

    fn is_pinned(&self, step: Step) -> bool {
        matches!(self.keep_every_n_steps, Some(n) if n > 0 && step % n == 0)
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            keep: config.keep,
            keep_every_n_steps: config.keep_every_n_steps,
        }
    }
}
