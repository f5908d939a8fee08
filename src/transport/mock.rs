//! In-memory transport for tests.
//!
//! Connect attempts are parked until the test resolves them with
//! [`MockTransport::accept`] or [`MockTransport::fail`]. Every callback runs
//! synchronously on the calling thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::packet::Packet;
use crate::server::ServerKey;
use crate::types::PacketType;

use super::{Connection, ConnectionHandler, SendCallback, Transport};

#[derive(Default)]
pub(crate) struct MockTransport {
    attempts: Mutex<VecDeque<(ServerKey, Arc<dyn ConnectionHandler>)>>,
    connects: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total connect calls so far.
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Unresolved attempts for `key`.
    pub(crate) fn pending(&self, key: &ServerKey) -> usize {
        self.attempts.lock().iter().filter(|(k, _)| k == key).count()
    }

    /// Remove the oldest unresolved attempt for `key` without resolving it.
    pub(crate) fn take_handler(&self, key: &ServerKey) -> Option<Arc<dyn ConnectionHandler>> {
        let mut attempts = self.attempts.lock();
        let index = attempts.iter().position(|(k, _)| k == key)?;
        attempts.remove(index).map(|(_, handler)| handler)
    }

    /// Resolve the oldest attempt for `key` with a fresh connection.
    pub(crate) fn accept(&self, key: &ServerKey) -> Option<Arc<MockConnection>> {
        let handler = self.take_handler(key)?;
        Some(MockConnection::establish(handler))
    }

    /// Resolve the oldest attempt for `key` with a refused connection.
    pub(crate) fn fail(&self, key: &ServerKey) -> bool {
        match self.take_handler(key) {
            Some(handler) => {
                handler.on_fail(PoolError::Io(std::io::ErrorKind::ConnectionRefused.into()));
                true
            }
            None => false,
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self, server: &ServerKey, handler: Arc<dyn ConnectionHandler>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().push_back((server.clone(), handler));
    }
}

pub(crate) struct MockConnection {
    handler: Arc<dyn ConnectionHandler>,
    sent: Mutex<Vec<Packet>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockConnection {
    /// Hand a new connection to `handler` through `on_accept`.
    pub(crate) fn establish(handler: Arc<dyn ConnectionHandler>) -> Arc<Self> {
        let connection = Arc::new(Self {
            handler: handler.clone(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });
        handler.on_accept(connection.clone());
        connection
    }

    pub(crate) fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_of(&self, packet_type: PacketType) -> Vec<Packet> {
        self.sent
            .lock()
            .iter()
            .filter(|packet| packet.packet_type == packet_type)
            .cloned()
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make every following send fail.
    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Simulate the peer closing the connection.
    pub(crate) fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handler.on_disconnect();
        }
    }

    /// Simulate an inbound packet.
    pub(crate) fn deliver(&self, packet: Packet) {
        if !self.is_closed() {
            self.handler.on_packet(packet);
        }
    }
}

impl Connection for MockConnection {
    fn send_packet(&self, packet: Packet, callback: Option<SendCallback>) {
        let result = if self.is_closed() || self.fail_sends.load(Ordering::SeqCst) {
            Err(PoolError::ConnectionClosed)
        } else {
            self.sent.lock().push(packet);
            Ok(())
        };
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
