//! Publisher, subscriber and service sessions
//!
//! Every session follows `Registering -> Registered -> Shutdown`. The node
//! keeps sessions type-erased behind the link traits below and recovers the
//! typed session with [`std::sync::Arc::downcast`] when the same name is
//! requested again.

mod events;
mod publisher;
mod service;
mod subscriber;

pub use events::{EventHub, SessionEvent};
pub use publisher::{AdvertiseOptions, Publisher, PublisherSession};
pub use service::{ServiceClient, ServiceServer, ServiceServerSession};
pub use subscriber::{SubscribeOptions, Subscriber, SubscriberSession};

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use rn_core::{MessageError, RosMessage, SessionState};

use crate::transport::InboundConnection;

/// Item carried through the delivery scheduler
pub enum Payload {
    /// A message a publisher still has to serialize
    Outgoing(Box<dyn OutgoingMessage>),
    /// A raw frame payload a subscriber still has to deserialize
    Incoming(Bytes),
}

/// A queued message that serializes itself at flush time
pub trait OutgoingMessage: Send {
    fn serialize(self: Box<Self>) -> Result<Bytes, MessageError>;
}

impl<M: RosMessage> OutgoingMessage for M {
    fn serialize(self: Box<Self>) -> Result<Bytes, MessageError> {
        (*self).resolve().to_bytes()
    }
}

/// Session state plus the gate that serializes registry calls
pub struct Lifecycle {
    state: Mutex<SessionState>,
    gate: tokio::sync::Mutex<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Registering),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == SessionState::Shutdown
    }

    /// Move to `Registered`. Returns `false` if the session already shut down.
    pub fn mark_registered(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Shutdown {
            return false;
        }
        *state = SessionState::Registered;
        true
    }

    /// Move to `Shutdown`. Returns `false` if it was already there.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Shutdown {
            return false;
        }
        *state = SessionState::Shutdown;
        true
    }

    /// Held across each register and unregister call so that the two are
    /// never in flight at once for one endpoint
    pub async fn registry_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased publisher as seen by the node
#[async_trait]
pub trait PublisherLink: Send + Sync {
    fn topic(&self) -> &str;
    fn type_name(&self) -> &str;
    fn num_peers(&self) -> usize;
    /// Take over a connection whose header named this topic
    async fn accept(self: Arc<Self>, conn: InboundConnection);
    async fn shutdown(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Type-erased subscriber as seen by the node
#[async_trait]
pub trait SubscriberLink: Send + Sync {
    fn topic(&self) -> &str;
    fn type_name(&self) -> &str;
    fn num_peers(&self) -> usize;
    /// Reconcile connections with the registry's publisher list
    fn handle_publisher_update(self: Arc<Self>, publishers: Vec<String>);
    async fn shutdown(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Type-erased service provider as seen by the node
#[async_trait]
pub trait ServiceLink: Send + Sync {
    fn service(&self) -> &str;
    fn type_name(&self) -> &str;
    /// Take over a connection whose header named this service
    async fn accept(self: Arc<Self>, conn: InboundConnection);
    async fn shutdown(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
