//! Subscriber session
//!
//! Keeps one connection per publisher the registry lists for the topic.
//! Frames read from publishers go through the delivery scheduler (or are
//! handled inline when throttling is disabled), then are deserialized once
//! and handed to every registered callback.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use rn_core::types::{STATUS_FAILURE, TCPROS};
use rn_core::{EndpointId, RegistryError, RegistryReply, RnError, RosMessage, SessionState};
use rn_protocol::header::validate_publisher_header;
use rn_protocol::{ConnectionHeader, ProtocolError};

use super::{EventHub, Lifecycle, Payload, SessionEvent, SubscriberLink};
use crate::context::NodeContext;
use crate::node::NodeInner;
use crate::scheduler::QueueHandler;
use crate::transport::{framed, read_header, reject, send_header, FrameReader, FrameWriter};

/// Per-subscriber settings; unset fields fall back to the node config
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub queue_size: Option<usize>,
    /// Minimum spacing between callback batches; negative handles inline
    pub throttle_ms: Option<i64>,
}

type Callback<M> = Arc<dyn Fn(M) -> anyhow::Result<()> + Send + Sync>;

/// Connection to one publisher, present from the moment it is requested
struct LinkState {
    link_id: u64,
    cancel: CancellationToken,
    connected: bool,
}

/// Subscriber state for one topic
pub struct SubscriberSession<M> {
    ctx: Arc<NodeContext>,
    topic: String,
    id: EndpointId,
    throttle_ms: i64,
    lifecycle: Lifecycle,
    events: EventHub,
    /// Keyed by publisher API URI
    links: Mutex<HashMap<String, LinkState>>,
    callbacks: Mutex<Vec<Callback<M>>>,
    next_link_id: AtomicU64,
    _message: PhantomData<fn() -> M>,
}

impl<M: RosMessage> SubscriberSession<M> {
    pub(crate) fn new(ctx: Arc<NodeContext>, topic: String, options: &SubscribeOptions) -> Arc<Self> {
        let throttle_ms = options
            .throttle_ms
            .unwrap_or(ctx.config.default_throttle_ms);
        Arc::new(Self {
            id: EndpointId::subscriber(&topic),
            ctx,
            topic,
            throttle_ms,
            lifecycle: Lifecycle::new(),
            events: EventHub::new(),
            links: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            next_link_id: AtomicU64::new(1),
            _message: PhantomData,
        })
    }

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

    pub(crate) fn add_callback<F>(&self, callback: F)
    where
        F: Fn(M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    async fn register(self: Arc<Self>) {
        let _gate = self.lifecycle.registry_gate().await;
        if self.lifecycle.is_shutdown() {
            return;
        }

        let result = self
            .ctx
            .registry
            .register_subscriber(&self.ctx.name, &self.topic, M::type_name(), &self.ctx.api_uri())
            .await
            .and_then(RegistryReply::into_result);

        match result {
            Ok(publishers) => {
                if self.lifecycle.mark_registered() {
                    tracing::info!(
                        "Registered subscriber for {} ({} publishers)",
                        self.topic,
                        publishers.len()
                    );
                    self.events.emit(SessionEvent::Registered);
                    Arc::clone(&self).update_publishers(publishers);
                } else {
                    tracing::debug!(
                        "Subscriber for {} registered after shutdown, ignoring {} publishers",
                        self.topic,
                        publishers.len()
                    );
                }
            }
            Err(e) => {
                tracing::error!("Failed to register subscriber for {}: {}", self.topic, e);
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Number of publishers with a completed handshake
    pub fn num_peers(&self) -> usize {
        self.links.lock().values().filter(|link| link.connected).count()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Connect to newly listed publishers and drop the ones no longer listed
    fn update_publishers(self: Arc<Self>, publishers: Vec<String>) {
        if self.lifecycle.is_shutdown() {
            tracing::debug!("Ignoring publisher update for {}: shut down", self.topic);
            return;
        }

        let mut to_connect = Vec::new();
        {
            let mut links = self.links.lock();

            let stale: Vec<String> = links
                .keys()
                .filter(|uri| !publishers.contains(uri))
                .cloned()
                .collect();
            for uri in stale {
                if let Some(link) = links.remove(&uri) {
                    link.cancel.cancel();
                    if link.connected {
                        tracing::info!("Publisher {} dropped from {}", uri, self.topic);
                        self.events.emit(SessionEvent::Disconnected { peer: uri });
                    }
                }
            }

            for uri in publishers {
                if links.contains_key(&uri) {
                    continue;
                }
                let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                links.insert(
                    uri.clone(),
                    LinkState {
                        link_id,
                        cancel: cancel.clone(),
                        connected: false,
                    },
                );
                to_connect.push((uri, link_id, cancel));
            }
        }

        for (uri, link_id, cancel) in to_connect {
            tokio::spawn(Arc::clone(&self).connect_to_publisher(uri, link_id, cancel));
        }
    }

    async fn connect_to_publisher(self: Arc<Self>, uri: String, link_id: u64, cancel: CancellationToken) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = self.open_link(&uri) => opened,
        };

        let (mut reader, writer, header) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to publisher {} for {}: {}",
                    uri,
                    self.topic,
                    e
                );
                self.drop_link(&uri, link_id);
                return;
            }
        };

        // The session may have shut down, or the publisher been dropped,
        // while the connection was being set up
        let wanted = {
            let mut links = self.links.lock();
            match links.get_mut(&uri) {
                Some(link) if link.link_id == link_id && !self.lifecycle.is_shutdown() => {
                    link.connected = true;
                    true
                }
                _ => false,
            }
        };
        if !wanted {
            tracing::debug!("Closing connection to {}: no longer wanted", uri);
            return;
        }

        tracing::info!(
            "Connected to publisher {} ({}) for {}",
            header.caller_id().unwrap_or("unknown"),
            uri,
            self.topic
        );
        self.events.emit(SessionEvent::Connected {
            peer: uri.clone(),
            header,
        });

        self.read_frames(&mut reader, &cancel).await;
        drop(writer);
        self.drop_link(&uri, link_id);
    }

    /// Look up the publisher's transport, connect and handshake
    async fn open_link(
        &self,
        uri: &str,
    ) -> Result<(FrameReader, FrameWriter, ConnectionHeader), RnError> {
        let protocols = vec![TCPROS.to_string()];
        let transport = self
            .ctx
            .peer_lookup
            .request_topic(uri, &self.ctx.name, &self.topic, &protocols)
            .await?
            .into_result()?
            .ok_or_else(|| RegistryError::Rejected {
                code: STATUS_FAILURE,
                message: format!("{} offered no transport", uri),
            })?;
        if transport.protocol != TCPROS {
            return Err(RegistryError::Rejected {
                code: STATUS_FAILURE,
                message: format!("unsupported protocol {}", transport.protocol),
            }
            .into());
        }

        let stream = TcpStream::connect(transport.address()).await?;
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = framed(stream);

        let request =
            ConnectionHeader::subscriber(&self.ctx.name, &self.topic, M::type_name(), M::md5sum());
        send_header(&mut writer, &request).await?;

        let reply = read_header(&mut reader).await?;
        if let Some(reason) = reply.error() {
            return Err(ProtocolError::PeerRejected(reason.to_string()).into());
        }
        if let Err(e) = validate_publisher_header(&reply, M::type_name(), M::md5sum()) {
            reject(&mut writer, peer_addr, &e.to_string()).await;
            return Err(e.into());
        }

        Ok((reader, writer, reply))
    }

    async fn read_frames(&self, reader: &mut FrameReader, cancel: &CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(frame)) => self.deliver(frame.payload),
                Some(Err(e)) => {
                    tracing::warn!("Error reading from publisher on {}: {}", self.topic, e);
                    break;
                }
                None => {
                    tracing::debug!("Publisher on {} closed its connection", self.topic);
                    break;
                }
            }
        }
    }

    fn deliver(&self, payload: Bytes) {
        if self.lifecycle.is_shutdown() {
            return;
        }
        tracing::trace!("Received {} bytes on {}", payload.len(), self.topic);
        if self.throttle_ms < 0 {
            self.handle_queue(vec![Payload::Incoming(payload)]);
        } else {
            self.ctx.scheduler.ping(&self.id, Payload::Incoming(payload));
        }
    }

    fn drop_link(&self, uri: &str, link_id: u64) {
        let removed = {
            let mut links = self.links.lock();
            let current = links.get(uri).map_or(false, |link| link.link_id == link_id);
            if current {
                links.remove(uri)
            } else {
                None
            }
        };
        if let Some(link) = removed {
            if link.connected {
                tracing::info!("Publisher {} disconnected from {}", uri, self.topic);
                self.events.emit(SessionEvent::Disconnected {
                    peer: uri.to_string(),
                });
            }
        }
    }

    fn dispatch(&self, message: M) {
        let callbacks: Vec<Callback<M>> = self.callbacks.lock().clone();
        for callback in callbacks {
            let message = message.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Subscriber callback on {} failed: {:#}", self.topic, e)
                }
                Err(_) => tracing::error!("Subscriber callback on {} panicked", self.topic),
            }
        }
    }

    /// Close every publisher connection, leave the scheduler and unregister
    pub async fn shutdown(&self) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        tracing::info!("Shutting down subscriber for {}", self.topic);

        let links: Vec<(String, LinkState)> = self.links.lock().drain().collect();
        for (uri, link) in links {
            link.cancel.cancel();
            if link.connected {
                self.events.emit(SessionEvent::Disconnected { peer: uri });
            }
        }
        self.ctx.scheduler.disconnect(&self.id);
        self.callbacks.lock().clear();

        let _gate = self.lifecycle.registry_gate().await;
        let result = self
            .ctx
            .registry
            .unregister_subscriber(&self.ctx.name, &self.topic, &self.ctx.api_uri())
            .await
            .and_then(RegistryReply::into_result);
        match result {
            Ok(_) => tracing::debug!("Unregistered subscriber for {}", self.topic),
            Err(e) => tracing::warn!("Failed to unregister subscriber for {}: {}", self.topic, e),
        }
    }
}

impl<M: RosMessage> QueueHandler<Payload> for SubscriberSession<M> {
    fn handle_queue(&self, batch: Vec<Payload>) {
        for item in batch {
            if self.lifecycle.is_shutdown() {
                return;
            }
            let Payload::Incoming(bytes) = item else {
                tracing::warn!("Subscriber for {} received an outgoing payload", self.topic);
                continue;
            };
            match M::decode(bytes) {
                Ok(message) => self.dispatch(message),
                Err(e) => {
                    tracing::warn!("Failed to deserialize message on {}: {}", self.topic, e);
                }
            }
        }
    }
}

#[async_trait]
impl<M: RosMessage> SubscriberLink for SubscriberSession<M> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn type_name(&self) -> &str {
        M::type_name()
    }

    fn num_peers(&self) -> usize {
        SubscriberSession::num_peers(self)
    }

    fn handle_publisher_update(self: Arc<Self>, publishers: Vec<String>) {
        self.update_publishers(publishers);
    }

    async fn shutdown(&self) {
        SubscriberSession::shutdown(self).await;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Application handle to a subscriber
pub struct Subscriber<M: RosMessage> {
    session: Arc<SubscriberSession<M>>,
    node: Weak<NodeInner>,
}

impl<M: RosMessage> Clone for Subscriber<M> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            node: self.node.clone(),
        }
    }
}

impl<M: RosMessage> Subscriber<M> {
    pub(crate) fn new(session: Arc<SubscriberSession<M>>, node: Weak<NodeInner>) -> Self {
        Self { session, node }
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

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Registered / connection / disconnect notifications
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events()
    }

    /// Stop receiving on this topic and remove it from the node
    pub async fn shutdown(&self) {
        if let Some(node) = self.node.upgrade() {
            node.forget_subscriber(&self.session.topic, Arc::as_ptr(&self.session) as *const ());
        }
        self.session.shutdown().await;
    }
}
