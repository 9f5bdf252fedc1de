//! Background save coordination
//!
//! An [`AsyncSaveCoordinator`] runs at most one save at a time. Its state
//! machine is `Idle -> Saving -> Idle`: a request that arrives while a save is
//! in flight waits for that save to finish before its own write is spawned, so
//! writes from one coordinator never overlap and run in request order.
//!
//! A failed background save is reported by the next `wait_previous` or
//! `save_async` call. There is no cancellation and no timeout.
//!
//! Two coordinators must not write into the same checkpoint directory; that
//! is up to the caller.

use checkpoint_core::{Error, Result, Step};
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Observable coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    /// No save is running
    Idle,

    /// A background save is running or being scheduled
    Saving,
}

/// The one in-flight save
#[derive(Debug)]
struct InFlightSave {
    step: Step,
    path: PathBuf,
    task: JoinHandle<Result<PathBuf>>,
}

/// Runs saves on a background task, one at a time
#[derive(Debug, Default)]
pub struct AsyncSaveCoordinator {
    // Held across the wait for the previous save, which queues later callers
    slot: Mutex<Option<InFlightSave>>,
}

impl AsyncSaveCoordinator {
    /// Create an idle coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, without waiting
    pub fn state(&self) -> SaveState {
        match self.slot.try_lock() {
            Ok(slot) => match slot.as_ref() {
                Some(save) if !save.task.is_finished() => SaveState::Saving,
                _ => SaveState::Idle,
            },
            Err(_) => SaveState::Saving,
        }
    }

    /// Step of the save currently tracked, if any
    pub fn in_flight_step(&self) -> Option<Step> {
        self.slot
            .try_lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|save| save.step))
    }

    /// Wait until no save is in flight
    ///
    /// Returns the path written by the save that was waited on, `None` when
    /// already idle, or that save's error.
    pub async fn wait_previous(&self) -> Result<Option<PathBuf>> {
        let mut slot = self.slot.lock().await;
        Self::finish(&mut slot).await
    }

    /// Schedule `write` on a background task once the previous save is done
    ///
    /// Returns as soon as the task is spawned. If the previous save failed,
    /// its error is returned and `write` is not scheduled.
    pub async fn save_async<F>(&self, step: Step, path: PathBuf, write: F) -> Result<()>
    where
        F: Future<Output = Result<PathBuf>> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        Self::finish(&mut slot).await?;

        if slot.is_some() {
            error!(step, "Async save slot still occupied after wait");
            return Err(Error::ConcurrentSave);
        }

        let task = tokio::spawn(write);
        info!(step, path = %path.display(), "Async save scheduled");
        *slot = Some(InFlightSave { step, path, task });
        Ok(())
    }

    async fn finish(slot: &mut Option<InFlightSave>) -> Result<Option<PathBuf>> {
        let Some(save) = slot.take() else {
            return Ok(None);
        };

        debug!(step = save.step, path = %save.path.display(), "Waiting for in-flight save");
        match save.task.await {
            Ok(Ok(path)) => {
                debug!(step = save.step, "In-flight save finished");
                Ok(Some(path))
            }
            Ok(Err(e)) => {
                error!(step = save.step, error = %e, "Async save failed");
                Err(e)
            }
            Err(join_err) => Err(Error::Internal {
                message: format!("async save for step {} did not complete: {}", save.step, join_err),
            }),
        }
    }
}
