//! Connection management for Gearman-style job servers.
//!
//! This crate keeps a pool of logical connections from a client or a worker
//! to one or more job servers. It does not submit or run jobs; it decides
//! when each connection opens, closes, waits and reconnects, and sends the
//! handful of control packets that go with those transitions.
//!
//! # Features
//!
//! - Per-server connection state machine with pluggable lost-connection policy
//! - Worker driver: capability announcements and a periodic heartbeat
//! - Client driver: lazy connections and job status polling
//! - Blocking TCP transport built on `std::net`
//! - Thread, manual and (with the `tokio` feature) Tokio schedulers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use gearman_pool::{ThreadScheduler, TcpTransport, Worker, WorkerConfig};
//!
//! let worker = Worker::new(
//!     WorkerConfig::default(),
//!     Arc::new(TcpTransport::default()),
//!     Arc::new(ThreadScheduler::new().unwrap()),
//! );
//!
//! worker.add_server("127.0.0.1:4730".parse::<std::net::SocketAddr>().unwrap()).unwrap();
//! worker
//!     .add_function("reverse", |payload: &[u8]| -> Bytes {
//!         payload.iter().rev().copied().collect::<Vec<u8>>().into()
//!     })
//!     .unwrap();
//! ```
//!
//! # Connection lifecycle
//!
//! ```text
//! CLOSED -> CONNECTING -> OPEN
//!   ^           |          |
//!   |           +----+-----+   lost: policy decides
//!   |                v
//!   +---------- WAITING        Reconnect
//!                               Drop -> DROPPED (terminal)
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod packet;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export commonly used types at the crate root
pub use client::Client;
pub use error::{PoolError, Result};
pub use packet::{Packet, StatusReply};
pub use pool::{
    Action, ConnectionController, ControllerHooks, ControllerState, Grounds, IdlePolicy,
    JobServerPool, JobStatus, LostConnectionPolicy, PoolConfig, StatusOutcome, WorkerConfig,
};
pub use scheduler::{ManualScheduler, Scheduler, TaskHandle, ThreadScheduler};
pub use server::{LocalServer, ServerKey};
pub use transport::{TcpTransport, TcpTransportConfig};
pub use types::{Magic, OperationResult, PacketType, HEADER_SIZE, MAX_PACKET_SIZE};
pub use worker::{Worker, WorkerFunction};

#[cfg(feature = "tokio")]
pub use scheduler::TokioScheduler;
