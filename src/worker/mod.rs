//! Worker flavour of the job-server pool.
//!
//! A worker only keeps connections open while it has at least one function
//! registered. Registering the first function starts the heartbeat and opens
//! every server; removing the last one stops the heartbeat and closes them
//! again (see [`IdlePolicy`]). In between, functions are announced and
//! withdrawn with `CAN_DO` and `CANT_DO` on each open connection.
//!
//! Lock order is activity, then controller, then registry.

mod heartbeat;

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{PoolError, Result};
use crate::packet::Packet;
use crate::pool::{
    ConnectionController, ControllerHooks, ControllerState, IdlePolicy, JobServerPool, PoolShared,
    WorkerConfig,
};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::transport::Transport;

/// A function a worker can perform.
pub trait WorkerFunction: Send + Sync {
    /// Run the function on a job payload.
    fn work(&self, payload: &[u8]) -> Bytes;
}

impl<F> WorkerFunction for F
where
    F: Fn(&[u8]) -> Bytes + Send + Sync,
{
    fn work(&self, payload: &[u8]) -> Bytes {
        self(payload)
    }
}

#[derive(Default)]
struct FunctionRegistry {
    functions: DashMap<String, Arc<dyn WorkerFunction>>,
}

impl FunctionRegistry {
    fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

/// Controller hooks for workers.
pub struct WorkerHooks {
    registry: Arc<FunctionRegistry>,
}

impl ControllerHooks for WorkerHooks {
    fn on_new(&self, controller: &ConnectionController<Self>) {
        if !self.registry.is_empty() {
            controller.open_server(false);
        }
    }

    fn on_open(&self, controller: &ConnectionController<Self>, _old: ControllerState) {
        if self.registry.is_empty() {
            debug!(server = %controller.key(), "no functions registered, closing");
            controller.close_server();
        }
    }

    fn on_reconnect(&self, controller: &ConnectionController<Self>) {
        if !self.registry.is_empty() {
            controller.open_server(false);
        }
    }

    fn announcements(&self, _controller: &ConnectionController<Self>) -> Vec<Packet> {
        self.registry
            .names()
            .iter()
            .map(|name| Packet::can_do(name))
            .collect()
    }
}

#[derive(Default)]
struct Activity {
    heartbeat: Option<TaskHandle>,
    idle_close: Option<TaskHandle>,
    idle_generation: u64,
}

/// A pool of job-server connections on behalf of a worker.
///
/// Dereferences to the underlying [`JobServerPool`] for server management.
pub struct Worker {
    pool: JobServerPool<WorkerHooks>,
    registry: Arc<FunctionRegistry>,
    activity: Arc<Mutex<Activity>>,
    heartbeat_period: Duration,
    idle_policy: IdlePolicy,
}

impl Worker {
    /// Create a worker with no servers and no functions.
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let registry = Arc::new(FunctionRegistry::default());
        let hooks_registry = registry.clone();
        let pool = JobServerPool::new(config.pool, transport, scheduler, move |_| WorkerHooks {
            registry: hooks_registry.clone(),
        });

        Self {
            pool,
            registry,
            activity: Arc::new(Mutex::new(Activity::default())),
            heartbeat_period: config.heartbeat_period,
            idle_policy: config.idle_policy,
        }
    }

    /// Register a function.
    ///
    /// Returns the function previously registered under `name`, if any. The
    /// first registration starts the heartbeat and opens every server.
    pub fn add_function(
        &self,
        name: impl Into<String>,
        function: impl WorkerFunction + 'static,
    ) -> Result<Option<Arc<dyn WorkerFunction>>> {
        let name = name.into();
        if name.is_empty() {
            return Err(PoolError::invalid_argument("function name is empty"));
        }
        if name.contains('\0') {
            return Err(PoolError::invalid_argument("function name contains NUL"));
        }
        if self.pool.is_shutdown() {
            return Err(PoolError::Shutdown);
        }

        let function: Arc<dyn WorkerFunction> = Arc::new(function);
        let mut activity = self.activity.lock();
        if let Some(previous) = self.registry.functions.insert(name.clone(), function) {
            debug!(function = %name, "function replaced");
            return Ok(Some(previous));
        }

        if let Some(idle_close) = activity.idle_close.take() {
            idle_close.cancel();
        }

        if activity.heartbeat.is_none() {
            info!(function = %name, "first function registered, connecting");
            activity.heartbeat = Some(heartbeat::start(self.pool.shared(), self.heartbeat_period));
            for controller in self.pool.controllers() {
                if !controller.open_server(false) {
                    controller.send_best_effort(Packet::can_do(&name));
                }
            }
        } else {
            debug!(function = %name, "function registered");
            for controller in self.pool.controllers() {
                controller.send_best_effort(Packet::can_do(&name));
            }
        }
        Ok(None)
    }

    /// Unregister a function. Returns `false` if it was not registered.
    pub fn remove_function(&self, name: &str) -> bool {
        let mut activity = self.activity.lock();
        if self.registry.functions.remove(name).is_none() {
            return false;
        }

        if self.registry.is_empty() {
            info!(function = %name, "last function removed");
            self.go_idle(&mut activity, Some(name));
        } else {
            debug!(function = %name, "function removed");
            for controller in self.pool.controllers() {
                controller.send_best_effort(Packet::cant_do(name));
            }
        }
        true
    }

    /// Unregister every function and go idle.
    pub fn remove_all_functions(&self) {
        let mut activity = self.activity.lock();
        self.registry.functions.clear();
        self.go_idle(&mut activity, None);
    }

    fn go_idle(&self, activity: &mut Activity, removed: Option<&str>) {
        if let Some(heartbeat) = activity.heartbeat.take() {
            heartbeat.cancel();
        }

        match self.idle_policy {
            IdlePolicy::CloseImmediately => close_all(self.pool.shared()),
            IdlePolicy::GracePeriod(period) => {
                if let Some(name) = removed {
                    for controller in self.pool.controllers() {
                        controller.send_best_effort(Packet::cant_do(name));
                    }
                }
                if let Some(previous) = activity.idle_close.take() {
                    previous.cancel();
                }
                activity.idle_generation += 1;

                let generation = activity.idle_generation;
                let pool = Arc::downgrade(self.pool.shared());
                let registry = self.registry.clone();
                let state = Arc::downgrade(&self.activity);
                activity.idle_close = Some(self.pool.scheduler().schedule_once(
                    period,
                    Box::new(move || close_if_idle(&state, &registry, &pool, generation)),
                ));
            }
        }
    }

    /// The function registered under `name`.
    pub fn function(&self, name: &str) -> Option<Arc<dyn WorkerFunction>> {
        self.registry
            .functions
            .get(name)
            .map(|entry| entry.value().clone())
    }

    /// Names of every registered function, sorted.
    pub fn registered_functions(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Check if the heartbeat is scheduled.
    pub fn is_heartbeat_running(&self) -> bool {
        self.activity.lock().heartbeat.is_some()
    }

    /// Stop the heartbeat and shut the pool down.
    pub fn shutdown(&self) {
        {
            let mut activity = self.activity.lock();
            if let Some(heartbeat) = activity.heartbeat.take() {
                heartbeat.cancel();
            }
            if let Some(idle_close) = activity.idle_close.take() {
                idle_close.cancel();
            }
        }
        self.pool.shutdown();
    }
}

fn close_all(pool: &Arc<PoolShared<WorkerHooks>>) {
    for controller in pool.snapshot() {
        controller.close_server();
    }
}

fn close_if_idle(
    activity: &Weak<Mutex<Activity>>,
    registry: &FunctionRegistry,
    pool: &Weak<PoolShared<WorkerHooks>>,
    generation: u64,
) {
    let (Some(activity), Some(pool)) = (activity.upgrade(), pool.upgrade()) else {
        return;
    };
    let mut activity = activity.lock();
    if activity.idle_generation != generation || activity.idle_close.is_none() {
        return;
    }
    activity.idle_close = None;
    if !registry.is_empty() {
        return;
    }
    debug!("idle grace period over, closing connections");
    close_all(&pool);
}

impl Deref for Worker {
    type Target = JobServerPool<WorkerHooks>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pool", &self.pool)
            .field("functions", &self.registered_functions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::remote;
    use crate::scheduler::ManualScheduler;
    use crate::transport::mock::MockTransport;
    use crate::types::PacketType;

    fn upper(payload: &[u8]) -> Bytes {
        Bytes::from(payload.to_ascii_uppercase())
    }

    fn reverse(payload: &[u8]) -> Bytes {
        payload.iter().rev().copied().collect::<Vec<u8>>().into()
    }

    fn worker(config: WorkerConfig) -> (Worker, Arc<MockTransport>, Arc<ManualScheduler>) {
        let transport = MockTransport::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let worker = Worker::new(config, transport.clone(), scheduler.clone());
        (worker, transport, scheduler)
    }

    #[test]
    fn test_no_functions_no_connections() {
        let (worker, transport, scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        assert!(worker.add_server(key.clone()).unwrap());

        let controller = worker.controller(&key).unwrap();
        assert_eq!(controller.state(), ControllerState::Closed);
        assert_eq!(transport.connect_count(), 0);
        assert!(!worker.is_heartbeat_running());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_first_function_connects_and_announces() {
        let (worker, transport, scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();

        assert!(worker.add_function("upper", upper).unwrap().is_none());
        assert!(worker.is_heartbeat_running());
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(transport.pending(&key), 1);

        let connection = transport.accept(&key).unwrap();
        assert_eq!(connection.sent(), vec![Packet::can_do("upper")]);
        assert_eq!(worker.controller(&key).unwrap().state(), ControllerState::Open);
    }

    #[test]
    fn test_server_added_after_function_connects() {
        let (worker, transport, _scheduler) = worker(WorkerConfig::default());
        worker.add_function("upper", upper).unwrap();

        let key = remote(4731);
        worker.add_server(key.clone()).unwrap();
        assert_eq!(
            worker.controller(&key).unwrap().state(),
            ControllerState::Connecting
        );
        assert_eq!(transport.pending(&key), 1);
    }

    #[test]
    fn test_more_functions_announced_on_open_connections() {
        let (worker, transport, _scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        let connection = transport.accept(&key).unwrap();

        worker.add_function("reverse", reverse).unwrap();
        assert_eq!(
            connection.sent_of(PacketType::CanDo),
            vec![Packet::can_do("upper"), Packet::can_do("reverse")]
        );
        assert_eq!(transport.connect_count(), 1);

        assert!(worker.remove_function("upper"));
        assert_eq!(
            connection.sent_of(PacketType::CantDo),
            vec![Packet::cant_do("upper")]
        );
        assert_eq!(worker.registered_functions(), vec!["reverse".to_string()]);
        assert!(worker.is_heartbeat_running());
    }

    #[test]
    fn test_replace_function_returns_previous() {
        let (worker, _transport, _scheduler) = worker(WorkerConfig::default());
        worker.add_function("echo", upper).unwrap();

        let previous = worker.add_function("echo", reverse).unwrap().unwrap();
        assert_eq!(previous.work(b"abc"), Bytes::from_static(b"ABC"));
        assert_eq!(
            worker.function("echo").unwrap().work(b"abc"),
            Bytes::from_static(b"cba")
        );
        assert_eq!(worker.registered_functions().len(), 1);
    }

    #[test]
    fn test_add_function_rejects_bad_names() {
        let (worker, _transport, _scheduler) = worker(WorkerConfig::default());
        assert!(matches!(
            worker.add_function("", upper),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            worker.add_function("a\0b", upper),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(worker.registered_functions().is_empty());
        assert!(!worker.is_heartbeat_running());
    }

    #[test]
    fn test_remove_unknown_function() {
        let (worker, _transport, _scheduler) = worker(WorkerConfig::default());
        assert!(!worker.remove_function("upper"));
    }

    #[test]
    fn test_last_function_removed_closes_immediately() {
        let (worker, transport, scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        let connection = transport.accept(&key).unwrap();

        assert!(worker.remove_function("upper"));

        assert!(connection.is_closed());
        assert_eq!(worker.controller(&key).unwrap().state(), ControllerState::Closed);
        assert!(!worker.is_heartbeat_running());
        assert_eq!(scheduler.pending(), 0);

        // No heartbeat left to reopen it.
        scheduler.advance(Duration::from_secs(60));
        assert_eq!(worker.controller(&key).unwrap().state(), ControllerState::Closed);
    }

    #[test]
    fn test_grace_period_withdraws_then_closes() {
        let (worker, transport, scheduler) = worker(
            WorkerConfig::default().with_idle_policy(IdlePolicy::GracePeriod(Duration::from_secs(10))),
        );
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        let connection = transport.accept(&key).unwrap();

        worker.remove_function("upper");
        assert_eq!(
            connection.sent_of(PacketType::CantDo),
            vec![Packet::cant_do("upper")]
        );
        assert!(!connection.is_closed());
        assert!(!worker.is_heartbeat_running());

        scheduler.advance(Duration::from_secs(9));
        assert!(!connection.is_closed());
        scheduler.advance(Duration::from_secs(1));
        assert!(connection.is_closed());
        assert_eq!(worker.controller(&key).unwrap().state(), ControllerState::Closed);
    }

    #[test]
    fn test_function_added_during_grace_period_keeps_connection() {
        let (worker, transport, scheduler) = worker(
            WorkerConfig::default().with_idle_policy(IdlePolicy::GracePeriod(Duration::from_secs(10))),
        );
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        let connection = transport.accept(&key).unwrap();

        worker.remove_function("upper");
        scheduler.advance(Duration::from_secs(5));
        worker.add_function("reverse", reverse).unwrap();
        scheduler.advance(Duration::from_secs(10));

        assert!(!connection.is_closed());
        assert!(worker.is_heartbeat_running());
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(
            connection.sent_of(PacketType::CanDo),
            vec![Packet::can_do("upper"), Packet::can_do("reverse")]
        );
    }

    #[test]
    fn test_remove_all_functions() {
        let (worker, transport, scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        worker.add_function("reverse", reverse).unwrap();
        let connection = transport.accept(&key).unwrap();

        worker.remove_all_functions();

        assert!(worker.registered_functions().is_empty());
        assert!(connection.is_closed());
        assert!(!worker.is_heartbeat_running());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_open_without_functions_closes_again() {
        let (worker, transport, _scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();

        let controller = worker.controller(&key).unwrap();
        controller.open_server(false);
        let connection = transport.accept(&key).unwrap();

        assert!(connection.is_closed());
        assert_eq!(controller.state(), ControllerState::Closed);
        assert!(connection.sent().is_empty());
    }

    #[test]
    fn test_heartbeat_reopens_closed_servers() {
        let (worker, transport, scheduler) = worker(
            WorkerConfig::default().with_heartbeat_period(Duration::from_secs(20)),
        );
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        transport.accept(&key).unwrap();

        let controller = worker.controller(&key).unwrap();
        controller.close_server();
        scheduler.advance(Duration::from_secs(19));
        assert_eq!(controller.state(), ControllerState::Closed);

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(controller.state(), ControllerState::Connecting);
        assert_eq!(transport.pending(&key), 1);
    }

    #[test]
    fn test_lost_connection_reconnects_while_functions_remain() {
        let (worker, transport, scheduler) = worker(
            WorkerConfig::default().with_pool_config(
                crate::pool::PoolConfig::default().with_reconnect_period(Duration::from_secs(5)),
            ),
        );
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        transport.fail(&key);

        let controller = worker.controller(&key).unwrap();
        assert_eq!(controller.state(), ControllerState::Waiting);
        scheduler.advance(Duration::from_secs(5));
        assert_eq!(controller.state(), ControllerState::Connecting);
    }

    #[test]
    fn test_shutdown() {
        let (worker, transport, scheduler) = worker(WorkerConfig::default());
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        let connection = transport.accept(&key).unwrap();
        let controller = worker.controller(&key).unwrap();

        worker.shutdown();

        assert!(connection.is_closed());
        assert_eq!(controller.state(), ControllerState::Dropped);
        assert!(!worker.is_heartbeat_running());
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(worker.server_count(), 0);
        assert!(matches!(
            worker.add_function("reverse", reverse),
            Err(PoolError::Shutdown)
        ));
    }

    #[test]
    fn test_heartbeat_times_out_silent_server() {
        let (worker, transport, scheduler) = worker(
            WorkerConfig::default()
                .with_pool_config(
                    crate::pool::PoolConfig::default()
                        .with_response_timeout(Duration::from_millis(1))
                        .with_reconnect_period(Duration::from_secs(60)),
                )
                .with_heartbeat_period(Duration::from_secs(20)),
        );
        let key = remote(4730);
        worker.add_server(key.clone()).unwrap();
        worker.add_function("upper", upper).unwrap();
        let connection = transport.accept(&key).unwrap();
        let controller = worker.controller(&key).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        scheduler.advance(Duration::from_secs(20));

        assert!(connection.is_closed());
        assert_eq!(controller.state(), ControllerState::Waiting);
        assert_eq!(controller.stats().timeout_count, 1);
    }
}
