//! Controller state and statistics.

use std::fmt;
use std::time::Instant;

/// Lifecycle state of a connection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerState {
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and ready.
    Open,
    /// Not connected; may be opened.
    #[default]
    Closed,
    /// Removed from its pool. No transition leaves this state.
    Dropped,
    /// Backing off after a lost connection.
    Waiting,
}

impl ControllerState {
    /// Check if the controller holds a live connection.
    pub fn is_open(&self) -> bool {
        *self == ControllerState::Open
    }

    /// Check if the controller has been dropped.
    pub fn is_terminal(&self) -> bool {
        *self == ControllerState::Dropped
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Connecting => "CONNECTING",
            ControllerState::Open => "OPEN",
            ControllerState::Closed => "CLOSED",
            ControllerState::Dropped => "DROPPED",
            ControllerState::Waiting => "WAITING",
        };
        f.write_str(name)
    }
}

/// Per-controller connection statistics.
#[derive(Debug, Clone, Default)]
pub struct ControllerStats {
    /// Number of connect attempts started.
    pub attempt_count: u64,
    /// Number of successful connections.
    pub connect_count: u64,
    /// Number of failed connect attempts.
    pub failure_count: u64,
    /// Number of unexpected disconnects.
    pub disconnect_count: u64,
    /// Number of response timeouts.
    pub timeout_count: u64,
    /// Number of times the controller entered the waiting state.
    pub wait_count: u64,
    /// Number of packets received.
    pub packets_received: u64,
    /// Time of last successful connection.
    pub last_connected: Option<Instant>,
    /// Time of last inbound packet.
    pub last_activity: Option<Instant>,
    /// Time of last lost connection of any kind.
    pub last_error: Option<Instant>,
}

impl ControllerStats {
    /// Record a connect attempt.
    pub fn record_attempt(&mut self) {
        self.attempt_count += 1;
    }

    /// Record a successful connection.
    pub fn record_connect(&mut self, now: Instant) {
        self.connect_count += 1;
        self.last_connected = Some(now);
    }

    /// Record a connection failure.
    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_error = Some(now);
    }

    /// Record an unexpected disconnect.
    pub fn record_disconnect(&mut self, now: Instant) {
        self.disconnect_count += 1;
        self.last_error = Some(now);
    }

    /// Record a response timeout.
    pub fn record_timeout(&mut self, now: Instant) {
        self.timeout_count += 1;
        self.last_error = Some(now);
    }

    /// Record entering the waiting state.
    pub fn record_wait(&mut self) {
        self.wait_count += 1;
    }

    /// Record an inbound packet.
    pub fn record_receive(&mut self, now: Instant) {
        self.packets_received += 1;
        self.last_activity = Some(now);
    }

    /// Time since the last successful connection.
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.last_connected.map(|t| t.elapsed())
    }
}
