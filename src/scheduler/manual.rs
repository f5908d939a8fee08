//! Deterministic scheduler driven by a virtual clock.

use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::Mutex;

use super::{run_guarded, Entry, Job, OnceTask, RepeatingTask, Scheduler, TaskHandle};

struct State {
    now: Duration,
    heap: BinaryHeap<Entry<Duration>>,
    next_seq: u64,
}

/// A scheduler whose clock only moves when [`advance`](Self::advance) is
/// called.
///
/// Due tasks run on the thread calling `advance`, in due order. Useful for
/// tests and simulations that must not depend on wall-clock timing.
pub struct ManualScheduler {
    state: Mutex<State>,
}

impl ManualScheduler {
    /// Create a scheduler at virtual time zero.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                now: Duration::ZERO,
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Current virtual time since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of tasks still scheduled and not cancelled.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .heap
            .iter()
            .filter(|entry| !entry.handle.is_cancelled())
            .count()
    }

    /// Move the clock forward by `by`, running every task that becomes due.
    ///
    /// Returns the number of task runs.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now.saturating_add(by);
        let mut runs = 0;

        loop {
            let entry = {
                let mut state = self.state.lock();
                match state.heap.peek() {
                    Some(next) if next.due <= target => {
                        let Some(entry) = state.heap.pop() else {
                            break;
                        };
                        state.now = entry.due;
                        entry
                    }
                    _ => {
                        state.now = target;
                        break;
                    }
                }
            };

            if entry.handle.is_cancelled() {
                continue;
            }

            runs += 1;
            match entry.job {
                Job::Once(task) => run_guarded(task),
                Job::Repeating { period, task } => {
                    run_guarded(|| task());
                    if !entry.handle.is_cancelled() {
                        let mut state = self.state.lock();
                        // A zero period would never let the clock advance.
                        let due = entry.due.saturating_add(period.max(Duration::from_nanos(1)));
                        Self::push(&mut state, due, Job::Repeating { period, task }, entry.handle);
                    }
                }
            }
        }

        runs
    }

    fn push(state: &mut State, due: Duration, job: Job, handle: TaskHandle) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            due,
            seq,
            job,
            handle,
        });
    }

    fn enqueue(&self, delay: Duration, job: Job) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut state = self.state.lock();
        let due = state.now.saturating_add(delay);
        Self::push(&mut state, due, job, handle.clone());
        handle
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TaskHandle {
        self.enqueue(delay, Job::Once(task))
    }

    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        self.enqueue(initial_delay, Job::Repeating { period, task })
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}
