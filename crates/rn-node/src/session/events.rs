//! Session notifications
//!
//! Sessions publish lifecycle events on a broadcast channel. Observers that
//! fall behind lose the oldest events; sessions never block on them.

use tokio::sync::broadcast;

use rn_protocol::ConnectionHeader;

const EVENT_CAPACITY: usize = 64;

/// Something that happened to a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The registry accepted the endpoint
    Registered,
    /// A peer completed the handshake
    Connected {
        peer: String,
        header: ConnectionHeader,
    },
    /// A peer connection closed
    Disconnected { peer: String },
}

/// Fan-out point for one session's events
pub struct EventHub {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
