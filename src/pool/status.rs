//! Outstanding job status requests.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::packet::StatusReply;
use crate::types::OperationResult;

/// Callback run once when a status record completes.
pub(crate) type CompletionCallback = Box<dyn FnOnce(&JobStatus) + Send>;

/// Final outcome of a status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusOutcome {
    /// How the request ended.
    pub result: OperationResult,
    /// Whether the server knows the job.
    pub known: bool,
    /// Whether the job is running.
    pub running: bool,
    /// Completion numerator.
    pub numerator: u64,
    /// Completion denominator.
    pub denominator: u64,
}

impl StatusOutcome {
    /// An outcome carrying no server data.
    pub fn failed(result: OperationResult) -> Self {
        Self {
            result,
            known: false,
            running: false,
            numerator: 0,
            denominator: 0,
        }
    }
}

impl From<&StatusReply> for StatusOutcome {
    fn from(reply: &StatusReply) -> Self {
        Self {
            result: OperationResult::Success,
            known: reply.known,
            running: reply.running,
            numerator: reply.numerator,
            denominator: reply.denominator,
        }
    }
}

/// One outstanding "get status" request.
///
/// Completes exactly once. Any number of threads may wait for it.
pub struct JobStatus {
    job_handle: Bytes,
    outcome: Mutex<Option<StatusOutcome>>,
    completed: Condvar,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl JobStatus {
    /// Create a pending record for `job_handle`.
    pub fn new(job_handle: impl Into<Bytes>) -> Self {
        Self {
            job_handle: job_handle.into(),
            outcome: Mutex::new(None),
            completed: Condvar::new(),
            on_complete: Mutex::new(None),
        }
    }

    pub(crate) fn with_callback(job_handle: Bytes, callback: CompletionCallback) -> Self {
        let status = Self::new(job_handle);
        *status.on_complete.lock() = Some(callback);
        status
    }

    /// Job handle this request polls.
    pub fn job_handle(&self) -> &Bytes {
        &self.job_handle
    }

    /// Complete the record. Returns `false` if it was already complete.
    ///
    /// Waiters are woken before the completion callback runs.
    pub fn complete(&self, outcome: StatusOutcome) -> bool {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }
        self.completed.notify_all();

        if let Some(callback) = self.on_complete.lock().take() {
            callback(self);
        }
        true
    }

    /// Check if the record has completed.
    pub fn is_complete(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// The outcome, if completed.
    pub fn outcome(&self) -> Option<StatusOutcome> {
        *self.outcome.lock()
    }

    /// Block until the record completes.
    pub fn wait(&self) -> StatusOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            self.completed.wait(&mut slot);
        }
    }

    /// Block until the record completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StatusOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            if self.completed.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        *slot
    }
}

impl fmt::Debug for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStatus")
            .field("job_handle", &self.job_handle)
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_complete_once() {
        let status = JobStatus::new(&b"H:host:1"[..]);
        assert!(!status.is_complete());

        assert!(status.complete(StatusOutcome::failed(OperationResult::RequestFailed)));
        assert!(!status.complete(StatusOutcome::failed(OperationResult::Success)));

        assert_eq!(
            status.outcome().map(|o| o.result),
            Some(OperationResult::RequestFailed)
        );
    }

    #[test]
    fn test_callback_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let status = JobStatus::with_callback(
            Bytes::from_static(b"H:host:2"),
            Box::new(move |status: &JobStatus| {
                assert!(status.is_complete());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        status.complete(StatusOutcome::failed(OperationResult::ServerDropped));
        status.complete(StatusOutcome::failed(OperationResult::ServerDropped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_unblocks_on_completion() {
        let status = Arc::new(JobStatus::new(&b"H:host:3"[..]));
        let waiter = {
            let status = status.clone();
            thread::spawn(move || status.wait())
        };

        let reply = StatusReply {
            job_handle: Bytes::from_static(b"H:host:3"),
            known: true,
            running: true,
            numerator: 3,
            denominator: 4,
        };
        status.complete(StatusOutcome::from(&reply));

        let outcome = waiter.join().unwrap();
        assert_eq!(outcome.result, OperationResult::Success);
        assert_eq!((outcome.numerator, outcome.denominator), (3, 4));
    }

    #[test]
    fn test_wait_timeout() {
        let status = JobStatus::new(&b"H:host:4"[..]);
        assert!(status.wait_timeout(Duration::from_millis(20)).is_none());
    }
}
