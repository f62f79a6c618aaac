//! Single-slot timeout scheduling.
//!
//! Each scheduled timeout runs as its own tokio task that sleeps and then sends the
//! [`TimeoutInfo`] into the engine's input queue. Only the most advanced timeout is kept:
//! scheduling a newer one aborts the pending task, scheduling an older one does nothing.

use keel_types::{Height, Round, RoundStep, Step};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A timeout for one protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutInfo {
    /// Height.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Step the timeout ends.
    pub step: Step,
    /// How long to wait.
    pub duration: Duration,
}

impl TimeoutInfo {
    /// Creates a timeout.
    pub fn new(height: Height, round: Round, step: Step, duration: Duration) -> Self {
        Self {
            height,
            round,
            step,
            duration,
        }
    }

    /// The protocol position this timeout belongs to.
    pub fn position(&self) -> RoundStep {
        RoundStep::new(self.height, self.round, self.step)
    }
}

/// Identifies a scheduled timeout so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle {
    id: u64,
    position: RoundStep,
}

impl TimeoutHandle {
    /// The position of the scheduled timeout.
    pub fn position(&self) -> RoundStep {
        self.position
    }
}

struct Pending {
    id: u64,
    info: TimeoutInfo,
    task: JoinHandle<()>,
}

/// Schedules at most one pending timeout, delivering it as `T` into a channel.
pub struct TimeoutScheduler<T> {
    sender: mpsc::Sender<T>,
    pending: Option<Pending>,
    next_id: u64,
}

impl<T> TimeoutScheduler<T>
where
    T: From<TimeoutInfo> + Send + 'static,
{
    /// Creates a scheduler that fires into `sender`.
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self {
            sender,
            pending: None,
            next_id: 0,
        }
    }

    /// Schedules `info`, replacing the pending timeout unless it is further along.
    ///
    /// Returns `None` when `info` is older than the pending timeout and was ignored.
    pub fn schedule(&mut self, info: TimeoutInfo) -> Option<TimeoutHandle> {
        if let Some(pending) = &self.pending {
            if info.position() < pending.info.position() && !pending.task.is_finished() {
                tracing::trace!(
                    ignored = %info.position(),
                    pending = %pending.info.position(),
                    "ignoring older timeout"
                );
                return None;
            }
        }
        self.abort_pending();

        let id = self.next_id;
        self.next_id += 1;
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(info.duration).await;
            // The receiver is gone only when the engine has stopped.
            let _ = sender.send(T::from(info)).await;
        });
        self.pending = Some(Pending { id, info, task });

        Some(TimeoutHandle {
            id,
            position: info.position(),
        })
    }

    /// Cancels the timeout if it is still the pending one.
    pub fn cancel(&mut self, handle: TimeoutHandle) {
        if self.pending.as_ref().is_some_and(|p| p.id == handle.id) {
            self.abort_pending();
        }
    }

    /// The pending timeout, if any.
    pub fn pending(&self) -> Option<TimeoutInfo> {
        self.pending.as_ref().map(|p| p.info)
    }

    fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}

impl<T> Drop for TimeoutScheduler<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}
