//! Publisher session
//!
//! Accepts subscriber connections routed by the node, validates their
//! headers, and writes every published message to each connected peer.
//! Each peer has its own writer task fed through an unbounded channel, so
//! a slow or failing peer never holds up delivery to the others.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use rn_core::{EndpointId, RegistryReply, RosMessage, SessionState};
use rn_protocol::header::{validate_subscriber_header, FIELD_TCP_NODELAY};
use rn_protocol::ConnectionHeader;

use super::{EventHub, Lifecycle, Payload, PublisherLink, SessionEvent};
use crate::context::NodeContext;
use crate::node::NodeInner;
use crate::scheduler::QueueHandler;
use crate::transport::{
    close, reject, send_frame, send_header, set_nodelay, FrameReader, FrameWriter,
    InboundConnection,
};

/// Minimum spacing of the "no subscribers" debug log
const NO_SUBSCRIBER_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Per-publisher settings; unset fields fall back to the node config
#[derive(Debug, Clone, Default)]
pub struct AdvertiseOptions {
    pub queue_size: Option<usize>,
    /// Minimum spacing between flushes; negative publishes synchronously
    pub throttle_ms: Option<i64>,
    /// Replay the last message to every newly connected subscriber
    pub latching: bool,
    pub tcp_nodelay: Option<bool>,
}

impl AdvertiseOptions {
    pub fn latching() -> Self {
        Self {
            latching: true,
            ..Self::default()
        }
    }
}

struct PeerHandle {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

/// Publisher state for one topic
pub struct PublisherSession<M> {
    ctx: Arc<NodeContext>,
    topic: String,
    id: EndpointId,
    latching: bool,
    tcp_nodelay: bool,
    throttle_ms: i64,
    lifecycle: Lifecycle,
    events: EventHub,
    /// Always locked before `latched`
    peers: Mutex<HashMap<u64, PeerHandle>>,
    latched: Mutex<Option<Bytes>>,
    next_peer_id: AtomicU64,
    last_idle_log: Mutex<Option<Instant>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: RosMessage> PublisherSession<M> {
    pub(crate) fn new(ctx: Arc<NodeContext>, topic: String, options: &AdvertiseOptions) -> Arc<Self> {
        let throttle_ms = options
            .throttle_ms
            .unwrap_or(ctx.config.default_throttle_ms);
        let tcp_nodelay = options.tcp_nodelay.unwrap_or(ctx.config.tcp_nodelay);
        Arc::new(Self {
            id: EndpointId::publisher(&topic),
            ctx,
            topic,
            latching: options.latching,
            tcp_nodelay,
            throttle_ms,
            lifecycle: Lifecycle::new(),
            events: EventHub::new(),
            peers: Mutex::new(HashMap::new()),
            latched: Mutex::new(None),
            next_peer_id: AtomicU64::new(1),
            last_idle_log: Mutex::new(None),
            _message: PhantomData,
        })
    }

    /// Hook into the scheduler and register with the registry in the background
    pub(crate) fn start(self: &Arc<Self>, queue_size: usize) {
        let handler: Arc<dyn QueueHandler<Payload>> = Arc::clone(self) as _;
        self.ctx.scheduler.add_client(
            self.id.clone(),
            Arc::downgrade(&handler),
            queue_size,
            self.throttle_ms,
        );
        tokio::spawn(Arc::clone(self).register());
    }

    async fn register(self: Arc<Self>) {
        let _gate = self.lifecycle.registry_gate().await;
        if self.lifecycle.is_shutdown() {
            return;
        }

        let result = self
            .ctx
            .registry
            .register_publisher(&self.ctx.name, &self.topic, M::type_name(), &self.ctx.api_uri())
            .await
            .and_then(RegistryReply::into_result);

        match result {
            Ok(subscribers) => {
                if self.lifecycle.mark_registered() {
                    tracing::info!(
                        "Registered publisher for {} ({} subscribers known)",
                        self.topic,
                        subscribers.len()
                    );
                    self.events.emit(SessionEvent::Registered);
                } else {
                    tracing::debug!(
                        "Publisher for {} registered after shutdown, ignoring",
                        self.topic
                    );
                }
            }
            Err(e) => {
                tracing::error!("Failed to register publisher for {}: {}", self.topic, e);
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn is_latching(&self) -> bool {
        self.latching
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish using the configured throttle
    pub fn publish(&self, message: M) {
        self.publish_with_throttle(message, self.throttle_ms);
    }

    /// Publish with an explicit throttle. A negative throttle bypasses the
    /// scheduler and writes to every peer immediately.
    pub fn publish_with_throttle(&self, message: M, throttle_ms: i64) {
        if self.lifecycle.is_shutdown() {
            tracing::debug!("Dropping publish on {}: publisher shut down", self.topic);
            return;
        }

        let payload = Payload::Outgoing(Box::new(message));
        if throttle_ms < 0 {
            self.handle_queue(vec![payload]);
        } else {
            self.ctx.scheduler.ping(&self.id, payload);
        }
    }

    fn write_to_peers(&self, frame: Bytes) {
        let peers = self.peers.lock();
        if peers.is_empty() {
            self.log_no_subscribers();
        }

        for peer in peers.values() {
            if peer.tx.send(frame.clone()).is_err() {
                tracing::debug!("Writer for subscriber {} already gone", peer.addr);
            }
        }

        if self.latching {
            *self.latched.lock() = Some(frame);
        }
    }

    fn log_no_subscribers(&self) {
        let mut last = self.last_idle_log.lock();
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= NO_SUBSCRIBER_LOG_INTERVAL,
            None => true,
        };
        if due {
            *last = Some(now);
            tracing::debug!("Publishing on {} with no subscribers", self.topic);
        }
    }

    async fn accept_subscriber(self: Arc<Self>, conn: InboundConnection) {
        let InboundConnection {
            reader,
            mut writer,
            header,
            peer_addr,
        } = conn;

        if self.lifecycle.is_shutdown() {
            reject(&mut writer, peer_addr, "publisher is shutting down").await;
            return;
        }

        if let Err(e) =
            validate_subscriber_header(&header, &self.topic, M::type_name(), M::md5sum())
        {
            reject(&mut writer, peer_addr, &e.to_string()).await;
            return;
        }

        let reply =
            ConnectionHeader::publisher_reply(&self.ctx.name, M::type_name(), M::md5sum(), self.latching);
        if let Err(e) = send_header(&mut writer, &reply).await {
            tracing::warn!("Failed to answer subscriber {}: {}", peer_addr, e);
            return;
        }

        if self.tcp_nodelay || header.get(FIELD_TCP_NODELAY) == Some("1") {
            set_nodelay(&writer, true);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut peers = self.peers.lock();
            if self.lifecycle.is_shutdown() {
                return;
            }
            if let Some(latched) = self.latched.lock().clone() {
                tracing::debug!("Replaying latched message on {} to {}", self.topic, peer_addr);
                let _ = tx.send(latched);
            }
            peers.insert(
                peer_id,
                PeerHandle {
                    addr: peer_addr,
                    tx,
                    cancel: cancel.clone(),
                },
            );
        }

        tracing::info!(
            "Subscriber {} ({}) connected to {}",
            header.caller_id().unwrap_or("unknown"),
            peer_addr,
            self.topic
        );
        self.events.emit(SessionEvent::Connected {
            peer: peer_addr.to_string(),
            header,
        });

        tokio::spawn(Arc::clone(&self).run_peer(peer_id, peer_addr, reader, writer, rx, cancel));
    }

    async fn run_peer(
        self: Arc<Self>,
        peer_id: u64,
        addr: SocketAddr,
        mut reader: FrameReader,
        mut writer: FrameWriter,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                outgoing = rx.recv() => match outgoing {
                    Some(frame) => {
                        tracing::trace!("Writing {} bytes on {} to {}", frame.len(), self.topic, addr);
                        if let Err(e) = send_frame(&mut writer, frame).await {
                            tracing::warn!("Failed to write to subscriber {}: {}", addr, e);
                            break;
                        }
                    }
                    None => break,
                },

                inbound = reader.next() => match inbound {
                    None => {
                        tracing::debug!("Subscriber {} closed its connection", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Error reading from subscriber {}: {}", addr, e);
                        break;
                    }
                    Some(Ok(_)) => {
                        tracing::trace!("Ignoring frame from subscriber {}", addr);
                    }
                },
            }
        }

        close(&mut writer).await;
        self.remove_peer(peer_id, addr);
    }

    fn remove_peer(&self, peer_id: u64, addr: SocketAddr) {
        let removed = self.peers.lock().remove(&peer_id).is_some();
        if removed {
            tracing::info!("Subscriber {} disconnected from {}", addr, self.topic);
            self.events.emit(SessionEvent::Disconnected {
                peer: addr.to_string(),
            });
        }
    }

    /// Close every peer, leave the scheduler and unregister
    pub async fn shutdown(&self) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        tracing::info!("Shutting down publisher for {}", self.topic);

        let peers: Vec<PeerHandle> = self.peers.lock().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.cancel.cancel();
            self.events.emit(SessionEvent::Disconnected {
                peer: peer.addr.to_string(),
            });
        }
        self.ctx.scheduler.disconnect(&self.id);

        let _gate = self.lifecycle.registry_gate().await;
        let result = self
            .ctx
            .registry
            .unregister_publisher(&self.ctx.name, &self.topic, &self.ctx.api_uri())
            .await
            .and_then(RegistryReply::into_result);
        match result {
            Ok(_) => tracing::debug!("Unregistered publisher for {}", self.topic),
            Err(e) => tracing::warn!("Failed to unregister publisher for {}: {}", self.topic, e),
        }
    }
}

impl<M: RosMessage> QueueHandler<Payload> for PublisherSession<M> {
    fn handle_queue(&self, batch: Vec<Payload>) {
        if self.lifecycle.is_shutdown() {
            return;
        }

        for item in batch {
            let Payload::Outgoing(message) = item else {
                tracing::warn!("Publisher for {} received an inbound payload", self.topic);
                continue;
            };
            match message.serialize() {
                Ok(frame) => self.write_to_peers(frame),
                Err(e) => {
                    tracing::error!("Failed to serialize message on {}: {}", self.topic, e);
                }
            }
        }
    }
}

#[async_trait]
impl<M: RosMessage> PublisherLink for PublisherSession<M> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn type_name(&self) -> &str {
        M::type_name()
    }

    fn num_peers(&self) -> usize {
        PublisherSession::num_peers(self)
    }

    async fn accept(self: Arc<Self>, conn: InboundConnection) {
        self.accept_subscriber(conn).await;
    }

    async fn shutdown(&self) {
        PublisherSession::shutdown(self).await;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Application handle to a publisher
pub struct Publisher<M: RosMessage> {
    session: Arc<PublisherSession<M>>,
    node: Weak<NodeInner>,
}

impl<M: RosMessage> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            node: self.node.clone(),
        }
    }
}

impl<M: RosMessage> Publisher<M> {
    pub(crate) fn new(session: Arc<PublisherSession<M>>, node: Weak<NodeInner>) -> Self {
        Self { session, node }
    }

    pub fn publish(&self, message: M) {
        self.session.publish(message);
    }

    pub fn publish_with_throttle(&self, message: M, throttle_ms: i64) {
        self.session.publish_with_throttle(message, throttle_ms);
    }

    pub fn topic(&self) -> &str {
        self.session.topic()
    }

    pub fn type_name(&self) -> &'static str {
        M::type_name()
    }

    pub fn num_peers(&self) -> usize {
        self.session.num_peers()
    }

    pub fn is_latching(&self) -> bool {
        self.session.is_latching()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Registered / connection / disconnect notifications
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events()
    }

    /// Stop publishing on this topic and remove it from the node
    pub async fn shutdown(&self) {
        if let Some(node) = self.node.upgrade() {
            node.forget_publisher(&self.session.topic, Arc::as_ptr(&self.session) as *const ());
        }
        self.session.shutdown().await;
    }
}
