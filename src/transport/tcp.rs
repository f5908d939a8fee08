//! TCP transport for job servers.
//!
//! Each connect attempt runs on its own thread. Once connected, the same
//! thread stays on as the reader, forwarding packets to the handler until
//! the stream ends. Each connection also gets a writer thread fed by a
//! queue; `send_packet` only enqueues, and send callbacks run on the writer
//! thread once the packet is flushed or has failed.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{read_packet, write_packet};
use crate::error::{PoolError, Result};
use crate::packet::Packet;
use crate::server::ServerKey;

use super::{Connection, ConnectionHandler, SendCallback, Transport};

/// Default TCP port for job servers.
pub const DEFAULT_PORT: u16 = 4730;

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on new connections.
    pub nodelay: bool,
    /// Write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
            write_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TcpTransportConfig {
    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set TCP nodelay.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

type Outgoing = (Packet, Option<SendCallback>);

/// A TCP connection with packet framing.
#[derive(Debug)]
pub struct TcpConnection {
    outbox: Mutex<Option<mpsc::Sender<Outgoing>>>,
    control: TcpStream,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

impl TcpConnection {
    fn open(stream: TcpStream, config: &TcpTransportConfig) -> io::Result<(Arc<Self>, TcpStream)> {
        let peer_addr = stream.peer_addr()?;
        if config.nodelay {
            stream.set_nodelay(true)?;
        }
        stream.set_write_timeout(config.write_timeout)?;

        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let (outbox, queue) = mpsc::channel();
        let connection = Arc::new(Self {
            outbox: Mutex::new(Some(outbox)),
            control,
            peer_addr,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&connection);
        thread::Builder::new()
            .name(format!("gearman-writer-{peer_addr}"))
            .spawn(move || Self::drain(weak, peer_addr, BufWriter::new(stream), queue))?;
        Ok((connection, reader))
    }

    /// Write queued packets in order until every sender is gone.
    fn drain(
        connection: Weak<Self>,
        peer_addr: SocketAddr,
        mut writer: BufWriter<TcpStream>,
        queue: mpsc::Receiver<Outgoing>,
    ) {
        while let Ok((packet, callback)) = queue.recv() {
            let result = match connection.upgrade() {
                Some(connection) => connection.write(&mut writer, &packet),
                None => Err(PoolError::ConnectionClosed),
            };
            if let Err(err) = &result {
                debug!(peer = %peer_addr, packet = ?packet.packet_type, %err, "send failed");
            }
            if let Some(callback) = callback {
                callback(result);
            }
        }
        trace!(peer = %peer_addr, "writer stopped");
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Check if the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A failed write shuts the socket down so the reader reports the loss.
    fn write(&self, writer: &mut BufWriter<TcpStream>, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::ConnectionClosed);
        }
        let written = write_packet(writer, packet).and_then(|()| Ok(writer.flush()?));
        if written.is_err() {
            let _ = self.control.shutdown(Shutdown::Both);
        }
        written
    }

    /// Read packets until the stream ends, then report the disconnect
    /// unless the connection was closed locally.
    fn pump(&self, reader: TcpStream, handler: &dyn ConnectionHandler) {
        let mut reader = BufReader::new(reader);
        loop {
            match read_packet(&mut reader) {
                Ok(packet) => handler.on_packet(packet),
                Err(PoolError::UnknownPacketType(kind)) => {
                    trace!(peer = %self.peer_addr, kind, "skipping packet");
                }
                Err(err) => {
                    if !self.closed.swap(true, Ordering::AcqRel) {
                        debug!(peer = %self.peer_addr, %err, "connection lost");
                        let _ = self.control.shutdown(Shutdown::Both);
                        handler.on_disconnect();
                    }
                    return;
                }
            }
        }
    }
}

impl Connection for TcpConnection {
    fn send_packet(&self, packet: Packet, callback: Option<SendCallback>) {
        let rejected = if self.is_closed() {
            Some((packet, callback))
        } else {
            match &*self.outbox.lock() {
                Some(outbox) => outbox.send((packet, callback)).err().map(|err| err.0),
                None => Some((packet, callback)),
            }
        };

        if let Some((packet, callback)) = rejected {
            debug!(peer = %self.peer_addr, packet = ?packet.packet_type, "send on closed connection");
            if let Some(callback) = callback {
                callback(Err(PoolError::ConnectionClosed));
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
        self.outbox.lock().take();
    }
}

/// Connects to remote job servers over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Get the transport configuration.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl Transport for TcpTransport {
    fn connect(&self, server: &ServerKey, handler: Arc<dyn ConnectionHandler>) {
        let Some(addr) = server.addr() else {
            handler.on_fail(PoolError::LocalServerUnsupported(server.to_string()));
            return;
        };

        let config = self.config.clone();
        let worker_handler = handler.clone();
        let spawned = thread::Builder::new()
            .name(format!("gearman-conn-{addr}"))
            .spawn(move || {
                let handler = worker_handler;
                let stream = match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(%addr, %err, "connect failed");
                        handler.on_fail(err.into());
                        return;
                    }
                };

                match TcpConnection::open(stream, &config) {
                    Ok((connection, reader)) => {
                        handler.on_accept(connection.clone());
                        connection.pump(reader, &*handler);
                    }
                    Err(err) => handler.on_fail(err.into()),
                }
            });

        if let Err(err) = spawned {
            handler.on_fail(err.into());
        }
    }
}
