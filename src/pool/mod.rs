//! Connection management for job servers.
//!
//! This module provides:
//! - [`ConnectionController`]: the per-server connection state machine
//! - [`JobServerPool`]: the set of controllers plus pool-wide settings
//! - [`LostConnectionPolicy`]: pluggable reaction to lost connections
//! - [`JobStatus`]: tracking of outstanding job status polls
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gearman_pool::pool::{ControllerHooks, ControllerState, JobServerPool, PoolConfig};
//! use gearman_pool::scheduler::ManualScheduler;
//! use gearman_pool::transport::TcpTransport;
//!
//! struct Quiet;
//! impl ControllerHooks for Quiet {}
//!
//! let pool = JobServerPool::new(
//!     PoolConfig::default(),
//!     Arc::new(TcpTransport::default()),
//!     Arc::new(ManualScheduler::new()),
//!     |_| Quiet,
//! );
//!
//! let server: std::net::SocketAddr = "127.0.0.1:4730".parse().unwrap();
//! assert!(pool.add_server(server).unwrap());
//!
//! let controller = pool.controller(&server.into()).unwrap();
//! assert_eq!(controller.state(), ControllerState::Closed);
//!
//! pool.shutdown();
//! assert_eq!(controller.state(), ControllerState::Dropped);
//! assert_eq!(pool.server_count(), 0);
//! ```

mod config;
mod controller;
mod job_server_pool;
mod policy;
mod state;
mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{IdlePolicy, PoolConfig, WorkerConfig, DEFAULT_CLIENT_ID};
pub use controller::{ConnectionController, ControllerHooks, WaitCallback};
pub use job_server_pool::JobServerPool;
pub use policy::{Action, DefaultPolicy, Grounds, LostConnectionPolicy};
pub use state::{ControllerState, ControllerStats};
pub use status::{JobStatus, StatusOutcome};

pub(crate) use job_server_pool::PoolShared;
