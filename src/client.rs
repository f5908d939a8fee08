//! Client flavour of the job-server pool.
//!
//! Clients connect lazily: adding a server does not open it, polling a job
//! status does. After a lost connection the client only reconnects while
//! status polls are still outstanding on that server.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::pool::{
    ConnectionController, ControllerHooks, ControllerState, JobServerPool, JobStatus, PoolConfig,
};
use crate::scheduler::Scheduler;
use crate::server::ServerKey;
use crate::transport::Transport;

/// Controller hooks for clients.
#[derive(Debug, Default)]
pub struct ClientHooks;

impl ControllerHooks for ClientHooks {
    fn on_reconnect(&self, controller: &ConnectionController<Self>) {
        if controller.has_pending_statuses() {
            controller.open_server(false);
        } else {
            debug!(server = %controller.key(), "nothing pending, staying closed");
        }
    }
}

/// A pool of job-server connections on behalf of a client.
///
/// Dereferences to the underlying [`JobServerPool`] for server management.
pub struct Client {
    pool: JobServerPool<ClientHooks>,
}

impl Client {
    /// Create a client with no servers.
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            pool: JobServerPool::new(config, transport, scheduler, |_| ClientHooks),
        }
    }

    /// Poll `server` for the status of `job_handle`.
    ///
    /// The returned record completes when the server answers, when the
    /// request cannot be delivered, or when the server is dropped. Polls for
    /// the same handle share one record.
    pub fn job_status(
        &self,
        server: &ServerKey,
        job_handle: impl Into<Bytes>,
    ) -> Result<Arc<JobStatus>> {
        if self.pool.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        let controller = self
            .pool
            .controller(server)
            .ok_or_else(|| PoolError::UnknownServer(server.to_string()))?;

        let status = controller
            .request_status(job_handle)
            .ok_or_else(|| PoolError::UnknownServer(server.to_string()))?;
        if controller.state() == ControllerState::Closed {
            controller.open_server(false);
        }
        Ok(status)
    }
}

impl Deref for Client {
    type Target = JobServerPool<ClientHooks>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}
