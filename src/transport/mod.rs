//! Transport seam between the pool and the network.
//!
//! The pool never performs I/O itself. It asks a [`Transport`] to connect,
//! and the transport reports back through the [`ConnectionHandler`] it was
//! given: exactly one of `on_accept` or `on_fail` per attempt, then
//! `on_packet` for inbound traffic and `on_disconnect` if the peer goes away.

use std::sync::Arc;

use crate::error::{PoolError, Result};
use crate::packet::Packet;
use crate::server::ServerKey;

pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};

/// Completion callback for a single send.
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// An established connection to a job server.
pub trait Connection: Send + Sync {
    /// Queue a packet for sending.
    ///
    /// Never blocks on the peer. The callback, if any, is invoked once the
    /// packet was written or the write failed.
    fn send_packet(&self, packet: Packet, callback: Option<SendCallback>);

    /// Close the connection. A locally closed connection does not report
    /// `on_disconnect`.
    fn close(&self);
}

/// Receives connection lifecycle events from a transport.
pub trait ConnectionHandler: Send + Sync {
    /// A connect attempt succeeded.
    fn on_accept(&self, connection: Arc<dyn Connection>);

    /// A connect attempt failed.
    fn on_fail(&self, error: PoolError);

    /// An established connection was closed by the peer.
    fn on_disconnect(&self);

    /// A packet arrived on an established connection.
    fn on_packet(&self, packet: Packet);
}

/// Opens connections to job servers.
pub trait Transport: Send + Sync {
    /// Start connecting to `server`. Must not block on the network; the
    /// outcome is delivered to `handler`, possibly before this returns.
    fn connect(&self, server: &ServerKey, handler: Arc<dyn ConnectionHandler>);
}
