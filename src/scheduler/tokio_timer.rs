//! Scheduler running tasks on a Tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::{run_guarded, OnceTask, RepeatingTask, Scheduler, TaskHandle};

/// Start used when an initial delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Runs each task as a Tokio timer task on the given runtime.
///
/// Tasks are synchronous closures; they run inline on a runtime worker, so
/// they must not block for long.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Schedule onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancel = handle.clone();
        self.handle.spawn(async move {
            time::sleep(delay).await;
            if !cancel.is_cancelled() {
                run_guarded(task);
            }
        });
        handle
    }

    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancel = handle.clone();
        let period = period.max(Duration::from_millis(1));
        self.handle.spawn(async move {
            let now = Instant::now();
            let start = now
                .checked_add(initial_delay)
                .unwrap_or_else(|| now + FAR_FUTURE);
            let mut ticks = time::interval_at(start, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if cancel.is_cancelled() {
                    return;
                }
                run_guarded(|| task());
            }
        });
        handle
    }
}
