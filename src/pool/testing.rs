//! Shared fixtures for pool tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::packet::Packet;
use crate::scheduler::ManualScheduler;
use crate::server::ServerKey;
use crate::transport::mock::MockTransport;
use crate::types::PacketType;

use super::{ConnectionController, ControllerHooks, ControllerState, JobServerPool, PoolConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookEvent {
    New,
    Connect(ControllerState),
    Open(ControllerState),
    Close(ControllerState),
    Drop(ControllerState),
    Wait(ControllerState),
    Reconnect,
    Packet(PacketType),
}

pub(crate) type EventLog = Arc<Mutex<Vec<(ServerKey, HookEvent)>>>;

/// Records every hook call; reopens on reconnect when asked to.
pub(crate) struct RecordingHooks {
    log: EventLog,
    reopen: Arc<AtomicBool>,
    announcements: Vec<Packet>,
}

impl RecordingHooks {
    fn record(&self, controller: &ConnectionController<Self>, event: HookEvent) {
        self.log.lock().push((controller.key().clone(), event));
    }
}

impl ControllerHooks for RecordingHooks {
    fn on_new(&self, controller: &ConnectionController<Self>) {
        self.record(controller, HookEvent::New);
    }

    fn on_connect(&self, controller: &ConnectionController<Self>, old: ControllerState) {
        self.record(controller, HookEvent::Connect(old));
    }

    fn on_open(&self, controller: &ConnectionController<Self>, old: ControllerState) {
        self.record(controller, HookEvent::Open(old));
    }

    fn on_close(&self, controller: &ConnectionController<Self>, old: ControllerState) {
        self.record(controller, HookEvent::Close(old));
    }

    fn on_drop(&self, controller: &ConnectionController<Self>, old: ControllerState) {
        self.record(controller, HookEvent::Drop(old));
    }

    fn on_wait(&self, controller: &ConnectionController<Self>, old: ControllerState) {
        self.record(controller, HookEvent::Wait(old));
    }

    fn on_reconnect(&self, controller: &ConnectionController<Self>) {
        self.record(controller, HookEvent::Reconnect);
        if self.reopen.load(Ordering::SeqCst) {
            controller.open_server(false);
        }
    }

    fn on_packet(&self, controller: &ConnectionController<Self>, packet: &Packet) {
        self.record(controller, HookEvent::Packet(packet.packet_type));
    }

    fn announcements(&self, _controller: &ConnectionController<Self>) -> Vec<Packet> {
        self.announcements.clone()
    }
}

pub(crate) struct Fixture {
    pub(crate) pool: JobServerPool<RecordingHooks>,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) scheduler: Arc<ManualScheduler>,
    pub(crate) log: EventLog,
    pub(crate) reopen: Arc<AtomicBool>,
}

impl Fixture {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self::with_announcements(config, Vec::new())
    }

    pub(crate) fn with_announcements(config: PoolConfig, announcements: Vec<Packet>) -> Self {
        let transport = MockTransport::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let log = EventLog::default();
        let reopen = Arc::new(AtomicBool::new(false));

        let pool = {
            let log = log.clone();
            let reopen = reopen.clone();
            JobServerPool::new(config, transport.clone(), scheduler.clone(), move |_| {
                RecordingHooks {
                    log: log.clone(),
                    reopen: reopen.clone(),
                    announcements: announcements.clone(),
                }
            })
        };

        Self {
            pool,
            transport,
            scheduler,
            log,
            reopen,
        }
    }

    /// Add `key` and return its controller.
    pub(crate) fn add(&self, key: &ServerKey) -> Arc<ConnectionController<RecordingHooks>> {
        assert!(self.pool.add_server(key.clone()).unwrap());
        self.pool.controller(key).unwrap()
    }

    pub(crate) fn events(&self, key: &ServerKey) -> Vec<HookEvent> {
        self.log
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub(crate) fn count(&self, key: &ServerKey, event: &HookEvent) -> usize {
        self.events(key).iter().filter(|e| *e == event).count()
    }

    pub(crate) fn clear_events(&self) {
        self.log.lock().clear();
    }
}

pub(crate) fn remote(port: u16) -> ServerKey {
    ServerKey::Remote(SocketAddr::from(([127, 0, 0, 1], port)))
}
