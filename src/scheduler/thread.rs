//! Scheduler backed by a single timer thread.

use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{run_guarded, Entry, Job, OnceTask, RepeatingTask, Scheduler, TaskHandle};

struct Queue {
    heap: BinaryHeap<Entry<Instant>>,
    next_seq: u64,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, due: Instant, job: Job, handle: TaskHandle) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            due,
            seq,
            job,
            handle,
        });
    }
}

/// Deadline used when `from + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// Runs tasks on a dedicated background thread.
///
/// Tasks run one at a time in due order, so a slow task delays the ones
/// behind it. The thread stops when the scheduler is dropped.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Start the timer thread.
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let runner = shared.clone();
        let thread = thread::Builder::new()
            .name("gearman-scheduler".into())
            .spawn(move || run(&runner))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Number of queued tasks, including cancelled ones not yet reaped.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    fn enqueue(&self, due: Instant, job: Job) -> TaskHandle {
        let handle = TaskHandle::new();
        self.shared.queue.lock().push(due, job, handle.clone());
        self.shared.wakeup.notify_one();
        handle
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            debug!("scheduler thread stopping");
            return;
        }

        let now = Instant::now();
        let next_due = queue.heap.peek().map(|entry| entry.due);
        match next_due {
            None => {
                shared.wakeup.wait(&mut queue);
            }
            Some(due) if due > now => {
                shared.wakeup.wait_for(&mut queue, due - now);
            }
            Some(_) => {
                let Some(entry) = queue.heap.pop() else {
                    continue;
                };
                if entry.handle.is_cancelled() {
                    continue;
                }

                // Never hold the queue lock while a task runs; tasks schedule
                // more tasks.
                let reschedule = parking_lot::MutexGuard::unlocked(&mut queue, || match entry.job {
                    Job::Once(task) => {
                        run_guarded(task);
                        None
                    }
                    Job::Repeating { period, task } => {
                        run_guarded(|| task());
                        Some((period, task))
                    }
                });

                if let Some((period, task)) = reschedule {
                    if !entry.handle.is_cancelled() {
                        queue.push(
                            deadline(entry.due, period),
                            Job::Repeating { period, task },
                            entry.handle,
                        );
                    }
                }
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TaskHandle {
        self.enqueue(deadline(Instant::now(), delay), Job::Once(task))
    }

    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        self.enqueue(
            deadline(Instant::now(), initial_delay),
            Job::Repeating { period, task },
        )
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("queued", &self.queued())
            .finish()
    }
}
