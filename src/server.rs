//! Job-server identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a job server running in this process.
///
/// Handles compare by identity: two handles are equal only if one was cloned
/// from the other.
#[derive(Debug, Clone)]
pub struct LocalServer {
    id: u64,
    name: Arc<str>,
}

impl LocalServer {
    /// Register a new in-process server handle.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    /// Process-unique identifier of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for LocalServer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalServer {}

impl Hash for LocalServer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Identifies a job server within a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerKey {
    /// A server reached over the network.
    Remote(SocketAddr),
    /// A server colocated in this process, assumed always reachable.
    Local(LocalServer),
}

impl ServerKey {
    /// Check if this key names an in-process server.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Network address, if this is a remote server.
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Remote(addr) => Some(*addr),
            Self::Local(_) => None,
        }
    }
}

impl From<SocketAddr> for ServerKey {
    fn from(addr: SocketAddr) -> Self {
        Self::Remote(addr)
    }
}

impl From<LocalServer> for ServerKey {
    fn from(server: LocalServer) -> Self {
        Self::Local(server)
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(addr) => write!(f, "{addr}"),
            Self::Local(server) => write!(f, "local:{}#{}", server.name, server.id),
        }
    }
}
