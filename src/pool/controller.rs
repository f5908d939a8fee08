//! Per-server connection state machine.
//!
//! A [`ConnectionController`] owns the lifecycle of one logical connection:
//!
//! ```text
//!            open()              accepted
//!   CLOSED ---------> CONNECTING ---------> OPEN
//!     ^                   |                  |
//!     |      failed       |   disconnected   |
//!     +-------------------+------------------+   (lost-connection policy)
//!     |                                      |
//!     |   expiry         wait()              v
//!     +----------- WAITING <------------- Drop/Reconnect
//!
//!   drop() from any state -> DROPPED (terminal)
//! ```
//!
//! All transitions happen under one re-entrant lock per controller, and the
//! flavour-specific [`ControllerHooks`] run under that lock too. Hooks may
//! call back into their controller from the same thread. The lock is released
//! before the control packets that follow an accepted connection are sent.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use tracing::{debug, info, trace, warn};

use crate::error::PoolError;
use crate::packet::Packet;
use crate::scheduler::TaskHandle;
use crate::server::ServerKey;
use crate::transport::{Connection, ConnectionHandler};
use crate::types::{OperationResult, PacketType};

use super::config::DEFAULT_CLIENT_ID;
use super::job_server_pool::PoolShared;
use super::policy::{inform_local, resolve, Action, Grounds};
use super::state::{ControllerState, ControllerStats};
use super::status::{JobStatus, StatusOutcome};

/// Callback run when a waiting period expires undisturbed.
pub type WaitCallback = Box<dyn FnOnce() + Send>;

/// Flavour-specific behavior plugged into the shared state machine.
///
/// Every hook except [`announcements`](Self::announcements) runs while the
/// controller lock is held, so a hook sees the state it was called for.
/// Hooks may drive their own controller (for example close it from
/// `on_open`) but must not block.
pub trait ControllerHooks: Send + Sync + Sized + 'static {
    /// The controller was just added to its pool.
    fn on_new(&self, _controller: &ConnectionController<Self>) {}

    /// A connect attempt is about to start.
    fn on_connect(&self, _controller: &ConnectionController<Self>, _old: ControllerState) {}

    /// A connection was established.
    fn on_open(&self, _controller: &ConnectionController<Self>, _old: ControllerState) {}

    /// The controller was closed.
    fn on_close(&self, _controller: &ConnectionController<Self>, _old: ControllerState) {}

    /// The controller was dropped from its pool.
    fn on_drop(&self, _controller: &ConnectionController<Self>, _old: ControllerState) {}

    /// The controller entered the waiting state.
    fn on_wait(&self, _controller: &ConnectionController<Self>, _old: ControllerState) {}

    /// A reconnect period armed by the lost-connection policy ran out. The
    /// controller is `Closed` again; reopen it if the connection is still
    /// wanted.
    fn on_reconnect(&self, _controller: &ConnectionController<Self>) {}

    /// A packet arrived on the open connection.
    fn on_packet(&self, _controller: &ConnectionController<Self>, _packet: &Packet) {}

    /// Packets to send after every successful connect, following the client
    /// ID announcement. Called without the controller lock.
    fn announcements(&self, _controller: &ConnectionController<Self>) -> Vec<Packet> {
        Vec::new()
    }
}

struct ControllerInner {
    state: ControllerState,
    connection: Option<Arc<dyn Connection>>,
    pending_retry: Option<TaskHandle>,
    /// Identifies the current connect attempt; stale transport events carry
    /// an older value.
    attempt: u64,
    wait_generation: u64,
    /// Last accept, inbound packet or status request on the open connection.
    last_activity: Option<Instant>,
    stats: ControllerStats,
}

/// State machine for the connection to one job server.
pub struct ConnectionController<H: ControllerHooks> {
    key: ServerKey,
    hooks: H,
    pool: Weak<PoolShared<H>>,
    me: Weak<Self>,
    inner: ReentrantMutex<RefCell<ControllerInner>>,
    statuses: OnceLock<DashMap<Bytes, Arc<JobStatus>>>,
}

impl<H: ControllerHooks> ConnectionController<H> {
    pub(crate) fn new(key: ServerKey, hooks: H, pool: Weak<PoolShared<H>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            key,
            hooks,
            pool,
            me: me.clone(),
            inner: ReentrantMutex::new(RefCell::new(ControllerInner {
                state: ControllerState::Closed,
                connection: None,
                pending_retry: None,
                attempt: 0,
                wait_generation: 0,
                last_activity: None,
                stats: ControllerStats::default(),
            })),
            statuses: OnceLock::new(),
        })
    }

    /// The server this controller connects to.
    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// The flavour hooks.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        self.inner.lock().borrow().state
    }

    /// The live connection, present only while `Open`.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.lock().borrow().connection.clone()
    }

    /// Snapshot of the connection statistics.
    pub fn stats(&self) -> ControllerStats {
        self.inner.lock().borrow().stats.clone()
    }

    pub(crate) fn notify_new(&self) {
        let _guard = self.inner.lock();
        self.hooks.on_new(self);
    }

    /// Start a connect attempt.
    ///
    /// Returns `false`, leaving the state untouched, when `Open`,
    /// `Connecting` or `Dropped`, and when `Waiting` unless `force` is set.
    pub fn open_server(&self, force: bool) -> bool {
        let guard = self.inner.lock();
        let (old, attempt) = {
            let mut inner = guard.borrow_mut();
            let old = inner.state;
            match old {
                ControllerState::Connecting | ControllerState::Open | ControllerState::Dropped => {
                    return false;
                }
                ControllerState::Waiting if !force => return false,
                ControllerState::Waiting | ControllerState::Closed => {}
            }

            if let Some(retry) = inner.pending_retry.take() {
                retry.cancel();
            }
            inner.state = ControllerState::Connecting;
            inner.attempt += 1;
            inner.stats.record_attempt();
            (old, inner.attempt)
        };

        debug!(server = %self.key, from = %old, "connecting");
        self.hooks.on_connect(self, old);

        if !self.is_current(attempt, ControllerState::Connecting) {
            return true;
        }
        if let Some(pool) = self.pool.upgrade() {
            let handler = Arc::new(Attempt {
                controller: self.me.clone(),
                attempt,
            });
            pool.transport().connect(&self.key, handler);
        }
        true
    }

    /// Close the connection, or stop connecting or waiting.
    ///
    /// No-op when already `Closed` or `Dropped`.
    pub fn close_server(&self) {
        let guard = self.inner.lock();
        let (old, connection, retry) = {
            let mut inner = guard.borrow_mut();
            let old = inner.state;
            if matches!(old, ControllerState::Closed | ControllerState::Dropped) {
                return;
            }
            inner.state = ControllerState::Closed;
            inner.last_activity = None;
            (old, inner.connection.take(), inner.pending_retry.take())
        };

        if let Some(connection) = connection {
            connection.close();
        }
        if let Some(retry) = retry {
            retry.cancel();
        }

        debug!(server = %self.key, from = %old, "closed");
        self.hooks.on_close(self, old);
    }

    /// Remove the controller from its pool for good.
    ///
    /// Closes any connection, cancels any pending retry and completes every
    /// pending status record with [`OperationResult::ServerDropped`].
    pub fn drop_server(&self) {
        let guard = self.inner.lock();
        let (old, connection, retry) = {
            let mut inner = guard.borrow_mut();
            let old = inner.state;
            if old == ControllerState::Dropped {
                return;
            }
            inner.state = ControllerState::Dropped;
            inner.last_activity = None;
            (old, inner.connection.take(), inner.pending_retry.take())
        };

        if let Some(pool) = self.pool.upgrade() {
            pool.remove_controller(&self.key, self);
        }
        if let Some(connection) = connection {
            connection.close();
        }
        if let Some(retry) = retry {
            retry.cancel();
        }

        info!(server = %self.key, from = %old, "dropped");
        self.abandon_statuses();
        self.hooks.on_drop(self, old);
    }

    /// Enter the waiting state for the pool's reconnect period.
    pub fn wait_server(&self, callback: WaitCallback) {
        let period = self
            .pool
            .upgrade()
            .map_or(Duration::ZERO, |pool| pool.reconnect_period());
        self.wait_server_for(callback, period);
    }

    /// Enter the waiting state for `period`.
    ///
    /// An open or connecting controller is closed first. When the period
    /// runs out and nothing else happened to the controller in the meantime,
    /// it becomes `Closed` and `callback` runs. Any earlier transition,
    /// including another wait, discards `callback`.
    pub fn wait_server_for(&self, callback: WaitCallback, period: Duration) {
        let guard = self.inner.lock();
        let old = guard.borrow().state;
        match old {
            ControllerState::Dropped => return,
            ControllerState::Open | ControllerState::Connecting => self.close_server(),
            ControllerState::Waiting | ControllerState::Closed => {}
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        let generation = {
            let mut inner = guard.borrow_mut();
            if inner.state == ControllerState::Dropped {
                return;
            }
            inner.wait_generation += 1;
            inner.wait_generation
        };

        // Never commit Waiting without an armed expiry.
        let me = self.me.clone();
        let handle = pool.scheduler().schedule_once(
            period,
            Box::new(move || {
                if let Some(controller) = me.upgrade() {
                    controller.expire_wait(generation, callback);
                }
            }),
        );

        {
            let mut inner = guard.borrow_mut();
            if let Some(retry) = inner.pending_retry.replace(handle) {
                retry.cancel();
            }
            inner.state = ControllerState::Waiting;
            inner.stats.record_wait();
        }

        debug!(server = %self.key, from = %old, ?period, "waiting");
        self.hooks.on_wait(self, old);
    }

    fn expire_wait(&self, generation: u64, callback: WaitCallback) {
        let guard = self.inner.lock();
        {
            let mut inner = guard.borrow_mut();
            if inner.state != ControllerState::Waiting || inner.wait_generation != generation {
                return;
            }
            inner.state = ControllerState::Closed;
            inner.pending_retry = None;
        }
        debug!(server = %self.key, "wait expired");
        callback();
    }

    /// Check an open connection for a response timeout at `now`.
    ///
    /// The connection times out when nothing happened on it for longer than
    /// the pool's response timeout. Returns `true` if the timeout transition
    /// was taken.
    pub fn timeout_check(&self, now: Instant) -> bool {
        let Some(timeout) = self.pool.upgrade().map(|pool| pool.response_timeout()) else {
            return false;
        };
        let guard = self.inner.lock();
        let expired = {
            let inner = guard.borrow();
            inner.state == ControllerState::Open
                && inner
                    .last_activity
                    .is_some_and(|since| now.saturating_duration_since(since) > timeout)
        };
        expired && self.timeout()
    }

    fn timeout(&self) -> bool {
        let guard = self.inner.lock();
        {
            let mut inner = guard.borrow_mut();
            if inner.state != ControllerState::Open {
                return false;
            }
            inner.stats.record_timeout(Instant::now());
        }
        warn!(server = %self.key, "response timeout");
        self.close_server();
        self.handle_lost_connection(Grounds::ResponseTimeout);
        true
    }

    fn handle_lost_connection(&self, grounds: Grounds) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let policy = pool.policy();

        if self.key.is_local() {
            let policy = policy.as_deref().unwrap_or(pool.default_policy());
            inform_local(policy, &self.key, grounds);
            return;
        }

        let action = resolve(policy.as_deref(), pool.default_policy(), &self.key, grounds);
        info!(server = %self.key, %grounds, ?action, "lost connection");
        match action {
            Action::Drop => self.drop_server(),
            Action::Reconnect => {
                let me = self.me.clone();
                self.wait_server_for(
                    Box::new(move || {
                        if let Some(controller) = me.upgrade() {
                            controller.hooks.on_reconnect(&controller);
                        }
                    }),
                    pool.reconnect_period(),
                );
            }
        }
    }

    fn is_current(&self, attempt: u64, state: ControllerState) -> bool {
        let inner = self.inner.lock();
        let inner = inner.borrow();
        inner.attempt == attempt && inner.state == state
    }

    fn accept(&self, attempt: u64, connection: Arc<dyn Connection>) {
        let guard = self.inner.lock();
        let shutdown = self.pool.upgrade().is_none_or(|pool| pool.is_shutdown());
        let accepted = {
            let mut inner = guard.borrow_mut();
            if inner.state == ControllerState::Connecting && inner.attempt == attempt && !shutdown {
                inner.state = ControllerState::Open;
                let now = Instant::now();
                inner.connection = Some(connection.clone());
                inner.last_activity = Some(now);
                inner.stats.record_connect(now);
                true
            } else {
                false
            }
        };

        if !accepted {
            debug!(server = %self.key, attempt, "closing unexpected connection");
            connection.close();
            if shutdown {
                self.drop_server();
            }
            return;
        }

        info!(server = %self.key, "connection open");
        self.hooks.on_open(self, ControllerState::Connecting);
        if !self.is_current(attempt, ControllerState::Open) {
            return;
        }

        drop(guard);
        self.announce(&*connection);
    }

    fn fail(&self, attempt: u64, error: PoolError) {
        let guard = self.inner.lock();
        {
            let mut inner = guard.borrow_mut();
            if inner.state != ControllerState::Connecting
                || inner.attempt != attempt
                || inner.connection.is_some()
            {
                return;
            }
            inner.stats.record_failure(Instant::now());
        }
        debug!(server = %self.key, %error, "connect failed");

        if self.pool.upgrade().is_none_or(|pool| pool.is_shutdown()) {
            self.drop_server();
            return;
        }
        self.close_server();
        self.handle_lost_connection(Grounds::FailedConnection);
    }

    fn disconnect(&self, attempt: u64) {
        let guard = self.inner.lock();
        {
            let mut inner = guard.borrow_mut();
            if inner.state != ControllerState::Open || inner.attempt != attempt {
                return;
            }
            inner.stats.record_disconnect(Instant::now());
        }
        self.close_server();
        self.handle_lost_connection(Grounds::UnexpectedDisconnect);
    }

    fn packet(&self, attempt: u64, packet: Packet) {
        let guard = self.inner.lock();
        let now = Instant::now();
        {
            let mut inner = guard.borrow_mut();
            if inner.state != ControllerState::Open || inner.attempt != attempt {
                return;
            }
            inner.last_activity = Some(now);
            inner.stats.record_receive(now);
        }
        trace!(server = %self.key, packet = ?packet.packet_type, "received");

        if packet.packet_type == PacketType::StatusRes {
            match packet.status_reply() {
                Some(reply) => {
                    if let Some(status) = self.remove_status(&reply.job_handle) {
                        status.complete(StatusOutcome::from(&reply));
                    }
                }
                None => {
                    warn!(server = %self.key, "malformed STATUS_RES");
                    if let Some(status) = packet.arg(0).and_then(|h| self.remove_status(h)) {
                        status.complete(StatusOutcome::failed(OperationResult::RequestFailed));
                    }
                }
            }
        }

        self.hooks.on_packet(self, &packet);
    }

    fn announce(&self, connection: &dyn Connection) {
        if let Some(pool) = self.pool.upgrade() {
            let client_id = pool.client_id();
            if client_id != DEFAULT_CLIENT_ID {
                self.send_on(connection, Packet::set_client_id(&client_id));
            }
        }

        for packet in self.hooks.announcements(self) {
            self.send_on(connection, packet);
        }

        if let Some(statuses) = self.statuses.get() {
            let handles: Vec<Bytes> = statuses.iter().map(|entry| entry.key().clone()).collect();
            for handle in handles {
                self.send_status_request(connection, handle);
            }
        }
    }

    /// Send a control packet if the controller is `Open`.
    ///
    /// Delivery is best effort: failures are logged and never retried.
    /// Returns `false` when there was no connection to send on.
    pub fn send_best_effort(&self, packet: Packet) -> bool {
        match self.open_connection() {
            Some(connection) => {
                self.send_on(&*connection, packet);
                true
            }
            None => false,
        }
    }

    fn open_connection(&self) -> Option<Arc<dyn Connection>> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        if inner.state == ControllerState::Open {
            inner.connection.clone()
        } else {
            None
        }
    }

    fn send_on(&self, connection: &dyn Connection, packet: Packet) {
        let server = self.key.clone();
        let packet_type = packet.packet_type;
        connection.send_packet(
            packet,
            Some(Box::new(move |result: crate::Result<()>| {
                if let Err(err) = result {
                    warn!(%server, packet = ?packet_type, %err, "control packet not delivered");
                }
            })),
        );
    }

    /// Get the pending status record for `job_handle`, creating it if needed.
    ///
    /// Returns `None` once the controller is dropped.
    pub fn create_status(&self, job_handle: impl Into<Bytes>) -> Option<Arc<JobStatus>> {
        let job_handle = job_handle.into();
        let guard = self.inner.lock();
        if guard.borrow().state == ControllerState::Dropped {
            return None;
        }

        let statuses = self.statuses.get_or_init(DashMap::new);
        let status = statuses
            .entry(job_handle.clone())
            .or_insert_with(|| Arc::new(self.new_status(job_handle)))
            .clone();
        Some(status)
    }

    fn new_status(&self, job_handle: Bytes) -> JobStatus {
        let me = self.me.clone();
        JobStatus::with_callback(
            job_handle,
            Box::new(move |status: &JobStatus| {
                let failed = status.outcome().is_some_and(|o| !o.result.is_successful());
                if let (true, Some(controller)) = (failed, me.upgrade()) {
                    controller.forget_status(status);
                }
            }),
        )
    }

    fn forget_status(&self, status: &JobStatus) {
        if let Some(statuses) = self.statuses.get() {
            statuses.remove_if(status.job_handle(), |_, tracked| {
                std::ptr::eq(Arc::as_ptr(tracked), status)
            });
        }
    }

    /// Stop tracking `job_handle`, returning its record.
    pub fn remove_status(&self, job_handle: &[u8]) -> Option<Arc<JobStatus>> {
        self.statuses
            .get()
            .and_then(|statuses| statuses.remove(job_handle))
            .map(|(_, status)| status)
    }

    /// Track `job_handle` and poll the server for it.
    ///
    /// The `GET_STATUS` request goes out now if the controller is `Open`,
    /// otherwise on the next successful connect. If the request cannot be
    /// sent the record completes with [`OperationResult::RequestFailed`].
    pub fn request_status(&self, job_handle: impl Into<Bytes>) -> Option<Arc<JobStatus>> {
        let job_handle = job_handle.into();
        let status = self.create_status(job_handle.clone())?;
        if let Some(connection) = self.open_connection() {
            if !status.is_complete() {
                self.send_status_request(&*connection, job_handle);
            }
        }
        Some(status)
    }

    fn send_status_request(&self, connection: &dyn Connection, job_handle: Bytes) {
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            if inner.state == ControllerState::Open {
                inner.last_activity = Some(Instant::now());
            }
        }

        let me = self.me.clone();
        let failed_handle = job_handle.clone();
        connection.send_packet(
            Packet::get_status(job_handle),
            Some(Box::new(move |result: crate::Result<()>| {
                let Err(err) = result else {
                    return;
                };
                let Some(controller) = me.upgrade() else {
                    return;
                };
                debug!(server = %controller.key, %err, "status request failed");
                if let Some(status) = controller.remove_status(&failed_handle) {
                    status.complete(StatusOutcome::failed(OperationResult::RequestFailed));
                }
            })),
        );
    }

    /// Check if any status record is still pending.
    pub fn has_pending_statuses(&self) -> bool {
        self.statuses.get().is_some_and(|statuses| !statuses.is_empty())
    }

    /// Number of pending status records.
    pub fn pending_status_count(&self) -> usize {
        self.statuses.get().map_or(0, |statuses| statuses.len())
    }

    fn abandon_statuses(&self) {
        let Some(statuses) = self.statuses.get() else {
            return;
        };
        let handles: Vec<Bytes> = statuses.iter().map(|entry| entry.key().clone()).collect();
        for handle in handles {
            if let Some((_, status)) = statuses.remove(&handle) {
                status.complete(StatusOutcome::failed(OperationResult::ServerDropped));
            }
        }
    }
}

impl<H: ControllerHooks> fmt::Debug for ConnectionController<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("pending_statuses", &self.pending_status_count())
            .finish()
    }
}

/// Routes transport events for one connect attempt to its controller.
struct Attempt<H: ControllerHooks> {
    controller: Weak<ConnectionController<H>>,
    attempt: u64,
}

impl<H: ControllerHooks> ConnectionHandler for Attempt<H> {
    fn on_accept(&self, connection: Arc<dyn Connection>) {
        match self.controller.upgrade() {
            Some(controller) => controller.accept(self.attempt, connection),
            None => connection.close(),
        }
    }

    fn on_fail(&self, error: PoolError) {
        if let Some(controller) = self.controller.upgrade() {
            controller.fail(self.attempt, error);
        }
    }

    fn on_disconnect(&self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.disconnect(self.attempt);
        }
    }

    fn on_packet(&self, packet: Packet) {
        if let Some(controller) = self.controller.upgrade() {
            controller.packet(self.attempt, packet);
        }
    }
}
