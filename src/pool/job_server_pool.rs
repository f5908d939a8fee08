//! The job-server pool.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{PoolError, Result};
use crate::packet::Packet;
use crate::scheduler::Scheduler;
use crate::server::ServerKey;
use crate::transport::Transport;

use super::config::PoolConfig;
use super::controller::{ConnectionController, ControllerHooks};
use super::policy::{DefaultPolicy, LostConnectionPolicy};

type HooksFactory<H> = Box<dyn Fn(&ServerKey) -> H + Send + Sync>;

struct PoolSettings {
    client_id: String,
    reconnect_period: Duration,
    response_timeout: Duration,
    policy: Option<Arc<dyn LostConnectionPolicy>>,
}

/// State shared between a pool and its controllers.
pub(crate) struct PoolShared<H: ControllerHooks> {
    controllers: DashMap<ServerKey, Arc<ConnectionController<H>>>,
    settings: RwLock<PoolSettings>,
    shutdown: AtomicBool,
    default_policy: Arc<dyn LostConnectionPolicy>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    factory: HooksFactory<H>,
}

impl<H: ControllerHooks> PoolShared<H> {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn client_id(&self) -> String {
        self.settings.read().client_id.clone()
    }

    pub(crate) fn reconnect_period(&self) -> Duration {
        self.settings.read().reconnect_period
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        self.settings.read().response_timeout
    }

    pub(crate) fn policy(&self) -> Option<Arc<dyn LostConnectionPolicy>> {
        self.settings.read().policy.clone()
    }

    pub(crate) fn default_policy(&self) -> &dyn LostConnectionPolicy {
        &*self.default_policy
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Remove `controller` from the map, unless `key` has since been taken
    /// by another controller.
    pub(crate) fn remove_controller(&self, key: &ServerKey, controller: &ConnectionController<H>) {
        self.controllers
            .remove_if(key, |_, current| std::ptr::eq(Arc::as_ptr(current), controller));
    }

    /// Snapshot of every controller.
    ///
    /// Controllers must never be driven while a map guard is held, since
    /// dropping a controller removes it from the map.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ConnectionController<H>>> {
        self.controllers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// A pool of connections to job servers.
///
/// The pool owns one [`ConnectionController`] per server. Controllers are
/// created through a hooks factory, which is how workers and clients plug
/// their behavior into the shared state machine.
///
/// Dropping the pool shuts it down.
pub struct JobServerPool<H: ControllerHooks> {
    shared: Arc<PoolShared<H>>,
}

impl<H: ControllerHooks> JobServerPool<H> {
    /// Create a pool whose default lost-connection policy always reconnects.
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        factory: impl Fn(&ServerKey) -> H + Send + Sync + 'static,
    ) -> Self {
        Self::with_default_policy(config, transport, scheduler, Arc::new(DefaultPolicy), factory)
    }

    /// Create a pool with a custom default lost-connection policy.
    ///
    /// The default policy answers whenever the current policy panics or
    /// abstains, and is restored by `set_lost_connection_policy(None)`.
    pub fn with_default_policy(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        default_policy: Arc<dyn LostConnectionPolicy>,
        factory: impl Fn(&ServerKey) -> H + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                controllers: DashMap::new(),
                settings: RwLock::new(PoolSettings {
                    client_id: config.client_id,
                    reconnect_period: config.reconnect_period,
                    response_timeout: config.response_timeout,
                    policy: None,
                }),
                shutdown: AtomicBool::new(false),
                default_policy,
                transport,
                scheduler,
                factory: Box::new(factory),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared<H>> {
        &self.shared
    }

    /// Add a server.
    ///
    /// Returns `Ok(false)` if the server is already in the pool. The new
    /// controller starts `Closed` and its `on_new` hook runs before this
    /// returns.
    pub fn add_server(&self, server: impl Into<ServerKey>) -> Result<bool> {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }

        let key = server.into();
        let controller = ConnectionController::new(
            key.clone(),
            (self.shared.factory)(&key),
            Arc::downgrade(&self.shared),
        );

        match self.shared.controllers.entry(key.clone()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(controller.clone());
            }
        }

        // A concurrent shutdown may have missed the insert.
        if self.is_shutdown() {
            controller.drop_server();
            return Err(PoolError::Shutdown);
        }

        debug!(server = %key, "server added");
        controller.notify_new();
        Ok(true)
    }

    /// Drop a server. Returns `false` if it was not in the pool.
    pub fn remove_server(&self, server: &ServerKey) -> bool {
        match self.controller(server) {
            Some(controller) => {
                controller.drop_server();
                true
            }
            None => false,
        }
    }

    /// Drop every server.
    pub fn remove_all_servers(&self) {
        for controller in self.shared.snapshot() {
            controller.drop_server();
        }
    }

    /// Check if a server is in the pool.
    pub fn has_server(&self, server: &ServerKey) -> bool {
        self.shared.controllers.contains_key(server)
    }

    /// Number of servers in the pool.
    pub fn server_count(&self) -> usize {
        self.shared.controllers.len()
    }

    /// The controller for a server.
    pub fn controller(&self, server: &ServerKey) -> Option<Arc<ConnectionController<H>>> {
        self.shared
            .controllers
            .get(server)
            .map(|entry| entry.value().clone())
    }

    /// Every controller in the pool, in no particular order.
    pub fn controllers(&self) -> Vec<Arc<ConnectionController<H>>> {
        self.shared.snapshot()
    }

    /// Set the client ID and announce it on every open connection.
    ///
    /// The ID must be non-empty and must not contain NUL bytes.
    pub fn set_client_id(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(PoolError::invalid_argument("client ID is empty"));
        }
        if id.contains('\0') {
            return Err(PoolError::invalid_argument("client ID contains NUL"));
        }

        {
            let mut settings = self.shared.settings.write();
            if self.is_shutdown() {
                return Err(PoolError::Shutdown);
            }
            settings.client_id = id.clone();
        }

        info!(client_id = %id, "client ID changed");
        for controller in self.shared.snapshot() {
            controller.send_best_effort(Packet::set_client_id(&id));
        }
        Ok(())
    }

    /// The client ID.
    pub fn client_id(&self) -> String {
        self.shared.client_id()
    }

    /// Set how long a controller waits before reconnecting after a lost
    /// connection. Waits already in progress keep their period.
    pub fn set_reconnect_period(&self, period: Duration) -> Result<()> {
        let mut settings = self.shared.settings.write();
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        settings.reconnect_period = period;
        Ok(())
    }

    /// The reconnect period.
    pub fn reconnect_period(&self) -> Duration {
        self.shared.reconnect_period()
    }

    /// Set the response timeout used by `timeout_check`.
    pub fn set_response_timeout(&self, timeout: Duration) -> Result<()> {
        let mut settings = self.shared.settings.write();
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        settings.response_timeout = timeout;
        Ok(())
    }

    /// The response timeout.
    pub fn response_timeout(&self) -> Duration {
        self.shared.response_timeout()
    }

    /// Replace the lost-connection policy. `None` restores the default.
    pub fn set_lost_connection_policy(
        &self,
        policy: Option<Arc<dyn LostConnectionPolicy>>,
    ) -> Result<()> {
        let mut settings = self.shared.settings.write();
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        settings.policy = policy;
        Ok(())
    }

    /// The scheduler shared by this pool's controllers.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        self.shared.scheduler()
    }

    /// Check if the pool has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Shut the pool down and drop every server.
    ///
    /// Idempotent. Afterwards servers cannot be added and settings cannot
    /// change.
    pub fn shutdown(&self) {
        {
            // Setters check the flag under the write lock.
            let _settings = self.shared.settings.write();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
        }

        info!(servers = self.server_count(), "shutting down pool");
        for controller in self.shared.snapshot() {
            controller.drop_server();
        }
    }
}

impl<H: ControllerHooks> Drop for JobServerPool<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<H: ControllerHooks> fmt::Debug for JobServerPool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobServerPool")
            .field("servers", &self.server_count())
            .field("client_id", &self.client_id())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
