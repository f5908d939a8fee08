//! Error types for job-server pool operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while managing job-server connections.
#[derive(Error, Debug)]
pub enum PoolError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The pool has been shut down and no longer accepts changes.
    #[error("In shutdown state")]
    Shutdown,

    /// An argument was rejected before any state was touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The server is not registered with the pool.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// Packet did not start with a request or response magic code.
    #[error("Wrong packet magic: 0x{0:08X}")]
    WrongMagic(u32),

    /// Packet type not understood by this crate.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u32),

    /// Malformed packet.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Packet too short to contain a header.
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// Connection closed before the operation could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport cannot reach in-process servers.
    #[error("Local server not supported by this transport: {0}")]
    LocalServerUnsupported(String),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Create a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new invalid packet error.
    pub fn invalid_packet(msg: impl Into<String>) -> Self {
        Self::InvalidPacket(msg.into())
    }

    /// Check if this error is recoverable (transient).
    ///
    /// Recoverable errors are worth a reconnect; the rest indicate misuse or a
    /// peer that does not speak the protocol.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::TimedOut
                || e.kind() == io::ErrorKind::Interrupted
                || e.kind() == io::ErrorKind::ConnectionRefused
                || e.kind() == io::ErrorKind::ConnectionReset
        ) || matches!(self, Self::ConnectionClosed)
    }
}
