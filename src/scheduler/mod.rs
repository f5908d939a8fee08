//! Delayed and periodic task execution.
//!
//! Controllers use a [`Scheduler`] for the one-shot expiry of the WAITING
//! state; workers use it for the periodic heartbeat. Every scheduled task is
//! referenced by a [`TaskHandle`], so owners cancel only their own tasks.
//!
//! Cancellation is best-effort: a task that is already running completes.
//! Callers that need a hard guarantee re-check their own state when the task
//! fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod manual;
mod thread;
#[cfg(feature = "tokio")]
mod tokio_timer;

pub use manual::ManualScheduler;
pub use thread::ThreadScheduler;
#[cfg(feature = "tokio")]
pub use tokio_timer::TokioScheduler;

/// A task that runs once.
pub type OnceTask = Box<dyn FnOnce() + Send>;

/// A task that runs on every period.
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync>;

/// Executes tasks after a delay or at a fixed rate.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TaskHandle;

    /// Run `task` after `initial_delay`, then every `period` until cancelled.
    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle;
}

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Create a fresh, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent any future run of the task.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A queued run, shared by the heap-based schedulers.
pub(crate) enum Job {
    Once(OnceTask),
    Repeating { period: Duration, task: RepeatingTask },
}

/// Heap entry ordered so that `BinaryHeap` pops the earliest due time first,
/// ties broken by insertion order.
pub(crate) struct Entry<T> {
    pub(crate) due: T,
    pub(crate) seq: u64,
    pub(crate) job: Job,
    pub(crate) handle: TaskHandle,
}

impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T: Ord> Eq for Entry<T> {}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Run a task, containing any panic so one bad task does not take the
/// scheduler down with it.
pub(crate) fn run_guarded(f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::warn!("scheduled task panicked");
    }
}
