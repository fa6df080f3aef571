//! Node runtime
//!
//! A [`Node`] owns the peer listener, the delivery scheduler and one map per
//! endpoint kind. Asking for an endpoint name that is already present hands
//! back the existing session, provided the message type matches.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rn_core::config::NodeConfig;
use rn_core::names::{anonymize_node_name, resolve_name, validate_node_name};
use rn_core::traits::{NodeApi, PeerLookup, Registry};
use rn_core::types::{STATUS_ERROR, STATUS_FAILURE, TCPROS};
use rn_core::{
    EndpointInfo, RegistryReply, RnError, RosMessage, RosService, SessionError, TopicTransport,
};

use crate::backoff::RegistryBackoff;
use crate::context::NodeContext;
use crate::process::ProcessClaim;
use crate::scheduler::DeliveryScheduler;
use crate::server::PeerListener;
use crate::session::{
    AdvertiseOptions, Publisher, PublisherLink, PublisherSession, ServiceClient, ServiceLink,
    ServiceServer, ServiceServerSession, SubscribeOptions, Subscriber, SubscriberLink,
    SubscriberSession,
};

/// Resolve a requested node name, appending a unique suffix when anonymous
pub(crate) fn resolve_node_name(name: &str, config: &NodeConfig) -> Result<String, SessionError> {
    let name = validate_node_name(name)?;
    if config.anonymous {
        Ok(anonymize_node_name(&name))
    } else {
        Ok(name)
    }
}

fn downcast<T: Send + Sync + 'static>(any: Arc<dyn Any + Send + Sync>) -> Option<Arc<T>> {
    any.downcast::<T>().ok()
}

/// State shared between a [`Node`], its listener and its endpoint handles
pub struct NodeInner {
    ctx: Arc<NodeContext>,
    publishers: DashMap<String, Arc<dyn PublisherLink>>,
    subscribers: DashMap<String, Arc<dyn SubscriberLink>>,
    services: DashMap<String, Arc<dyn ServiceLink>>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    /// Present when the node was created through `init_node`
    claim: Mutex<Option<ProcessClaim>>,
    self_ref: Weak<NodeInner>,
}

impl NodeInner {
    pub(crate) fn publisher_link(&self, topic: &str) -> Option<Arc<dyn PublisherLink>> {
        self.publishers.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn service_link(&self, service: &str) -> Option<Arc<dyn ServiceLink>> {
        self.services.get(service).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the publisher entry for `topic` if it still points at `session`
    pub(crate) fn forget_publisher(&self, topic: &str, session: *const ()) {
        self.publishers
            .remove_if(topic, |_, link| Arc::as_ptr(link) as *const () == session);
    }

    pub(crate) fn forget_subscriber(&self, topic: &str, session: *const ()) {
        self.subscribers
            .remove_if(topic, |_, link| Arc::as_ptr(link) as *const () == session);
    }

    pub(crate) fn forget_service(&self, service: &str, session: *const ()) {
        self.services
            .remove_if(service, |_, link| Arc::as_ptr(link) as *const () == session);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl NodeApi for NodeInner {
    fn request_topic(
        &self,
        caller_id: &str,
        topic: &str,
        protocols: &[String],
    ) -> RegistryReply<Option<TopicTransport>> {
        if self.publisher_link(topic).is_none() {
            tracing::debug!("{} requested unknown topic {}", caller_id, topic);
            return RegistryReply::with_code(
                STATUS_FAILURE,
                format!("Not a publisher of {}", topic),
                None,
            );
        }

        if !protocols.iter().any(|protocol| protocol == TCPROS) {
            tracing::debug!("{} offered no supported protocol for {}", caller_id, topic);
            return RegistryReply::with_code(STATUS_ERROR, "No supported protocols", None);
        }

        RegistryReply::success(
            format!("Ready on {}:{}", self.ctx.host, self.ctx.port),
            Some(TopicTransport::tcpros(self.ctx.host.clone(), self.ctx.port)),
        )
    }

    fn publisher_update(
        &self,
        caller_id: &str,
        topic: &str,
        publishers: Vec<String>,
    ) -> RegistryReply<i32> {
        let link = self.subscribers.get(topic).map(|entry| Arc::clone(entry.value()));
        match link {
            Some(link) => {
                tracing::debug!(
                    "Publisher update for {} from {}: {} publishers",
                    topic,
                    caller_id,
                    publishers.len()
                );
                link.handle_publisher_update(publishers);
                RegistryReply::success("Publisher update handled", 0)
            }
            None => RegistryReply::with_code(
                STATUS_FAILURE,
                format!("Not subscribed to {}", topic),
                0,
            ),
        }
    }

    fn publications(&self) -> RegistryReply<Vec<EndpointInfo>> {
        let publications = self
            .publishers
            .iter()
            .map(|entry| EndpointInfo {
                name: entry.key().clone(),
                type_name: entry.value().type_name().to_string(),
            })
            .collect();
        RegistryReply::success("Publications", publications)
    }

    fn subscriptions(&self) -> RegistryReply<Vec<EndpointInfo>> {
        let subscriptions = self
            .subscribers
            .iter()
            .map(|entry| EndpointInfo {
                name: entry.key().clone(),
                type_name: entry.value().type_name().to_string(),
            })
            .collect();
        RegistryReply::success("Subscriptions", subscriptions)
    }

    fn master_uri(&self) -> RegistryReply<String> {
        RegistryReply::success("Master URI", self.ctx.config.master_uri.clone())
    }

    fn shutdown(&self, caller_id: &str, reason: &str) -> RegistryReply<i32> {
        tracing::warn!("Received shutdown command from {}: {}", caller_id, reason);
        if self.is_shutting_down() {
            return RegistryReply::success("Already shutting down", 0);
        }

        let Some(inner) = self.self_ref.upgrade() else {
            return RegistryReply::with_code(STATUS_FAILURE, "Node is gone", 0);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { Node { inner }.shutdown().await });
                RegistryReply::success(format!("Shutting down {}", self.ctx.name), 0)
            }
            Err(e) => {
                tracing::error!("Cannot schedule shutdown of {}: {}", self.ctx.name, e);
                RegistryReply::with_code(STATUS_ERROR, "No runtime to shut down on", 0)
            }
        }
    }
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start a node without claiming the process-wide slot.
    ///
    /// The peer listener is bound before anything talks to the registry, so
    /// the advertised URI always carries the real port.
    pub async fn start(
        name: &str,
        config: NodeConfig,
        registry: Arc<dyn Registry>,
        peer_lookup: Arc<dyn PeerLookup>,
    ) -> Result<Self, RnError> {
        let name = resolve_node_name(name, &config)?;
        Self::start_resolved(name, config, registry, peer_lookup).await
    }

    pub(crate) async fn start_resolved(
        name: String,
        config: NodeConfig,
        registry: Arc<dyn Registry>,
        peer_lookup: Arc<dyn PeerLookup>,
    ) -> Result<Self, RnError> {
        let listener = TcpListener::bind(config.listen_address()).await?;
        let port = listener.local_addr()?.port();
        let host = config.resolve_advertised_host();

        let cancel = CancellationToken::new();
        let scheduler = DeliveryScheduler::new();
        scheduler.spawn(cancel.child_token());

        let ctx = Arc::new(NodeContext {
            name,
            host,
            port,
            config,
            registry,
            peer_lookup,
            scheduler,
        });

        let inner = Arc::new_cyclic(|self_ref| NodeInner {
            ctx,
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            services: DashMap::new(),
            cancel: cancel.clone(),
            shutting_down: AtomicBool::new(false),
            claim: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let peer_listener = PeerListener::new(listener, Arc::downgrade(&inner), cancel.child_token());
        tokio::spawn(peer_listener.run());

        let api: Arc<dyn NodeApi> = Arc::clone(&inner) as _;
        inner
            .ctx
            .registry
            .bind_node_api(&inner.ctx.api_uri(), Arc::downgrade(&api));

        tracing::info!(
            "Node {} started at {}",
            inner.ctx.name,
            inner.ctx.api_uri()
        );
        Ok(Self { inner })
    }

    pub(crate) fn attach_claim(&self, claim: ProcessClaim) {
        *self.inner.claim.lock() = Some(claim);
    }

    /// Slash-rooted node name
    pub fn name(&self) -> &str {
        &self.inner.ctx.name
    }

    /// URI under which the registry knows this node
    pub fn api_uri(&self) -> String {
        self.inner.ctx.api_uri()
    }

    /// Port of the peer listener
    pub fn port(&self) -> u16 {
        self.inner.ctx.port
    }

    pub fn master_uri(&self) -> &str {
        &self.inner.ctx.config.master_uri
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// The callback surface the registry and other nodes use
    pub fn api(&self) -> Arc<dyn NodeApi> {
        Arc::clone(&self.inner) as _
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.inner.is_shutting_down() {
            return Err(SessionError::Shutdown(self.inner.ctx.name.clone()));
        }
        Ok(())
    }

    /// Publish `M` on `topic`
    pub fn advertise<M: RosMessage>(
        &self,
        topic: &str,
        options: AdvertiseOptions,
    ) -> Result<Publisher<M>, RnError> {
        self.ensure_running()?;
        let topic = resolve_name(topic)?;
        let ctx = &self.inner.ctx;

        let session = match self.inner.publishers.entry(topic.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                downcast::<PublisherSession<M>>(Arc::clone(&existing).as_any()).ok_or_else(
                    || SessionError::TypeMismatch {
                        kind: "publisher",
                        name: topic.clone(),
                        existing: existing.type_name().to_string(),
                        requested: M::type_name().to_string(),
                    },
                )?
            }
            Entry::Vacant(entry) => {
                let session = PublisherSession::<M>::new(Arc::clone(ctx), topic.clone(), &options);
                session.start(options.queue_size.unwrap_or(ctx.config.default_queue_size));
                entry.insert(Arc::clone(&session) as Arc<dyn PublisherLink>);
                tracing::debug!("Created publisher for {} ({})", topic, M::type_name());
                session
            }
        };

        Ok(Publisher::new(session, self.inner.self_ref.clone()))
    }

    /// Receive `M` on `topic`. A second subscription to the same topic adds
    /// its callback to the existing session.
    pub fn subscribe<M, F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscriber<M>, RnError>
    where
        M: RosMessage,
        F: Fn(M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let topic = resolve_name(topic)?;
        let ctx = &self.inner.ctx;

        let session = match self.inner.subscribers.entry(topic.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                let session = downcast::<SubscriberSession<M>>(Arc::clone(&existing).as_any())
                    .ok_or_else(|| SessionError::TypeMismatch {
                        kind: "subscriber",
                        name: topic.clone(),
                        existing: existing.type_name().to_string(),
                        requested: M::type_name().to_string(),
                    })?;
                session.add_callback(callback);
                session
            }
            Entry::Vacant(entry) => {
                let session =
                    SubscriberSession::<M>::new(Arc::clone(ctx), topic.clone(), &options);
                session.add_callback(callback);
                session.start(options.queue_size.unwrap_or(ctx.config.default_queue_size));
                entry.insert(Arc::clone(&session) as Arc<dyn SubscriberLink>);
                tracing::debug!("Created subscriber for {} ({})", topic, M::type_name());
                session
            }
        };

        Ok(Subscriber::new(session, self.inner.self_ref.clone()))
    }

    /// Serve `S` under `service`. If the service is already advertised with
    /// the same type the existing provider is returned and `handler` is unused.
    pub fn advertise_service<S, F>(
        &self,
        service: &str,
        handler: F,
    ) -> Result<ServiceServer<S>, RnError>
    where
        S: RosService,
        F: Fn(S::Request) -> anyhow::Result<S::Response> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let service = resolve_name(service)?;
        let ctx = &self.inner.ctx;

        let session = match self.inner.services.entry(service.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                let session =
                    downcast::<ServiceServerSession<S>>(Arc::clone(&existing).as_any())
                        .ok_or_else(|| SessionError::TypeMismatch {
                            kind: "service",
                            name: service.clone(),
                            existing: existing.type_name().to_string(),
                            requested: S::type_name().to_string(),
                        })?;
                tracing::warn!("Service {} already advertised, keeping its handler", service);
                session
            }
            Entry::Vacant(entry) => {
                let session =
                    ServiceServerSession::<S>::new(Arc::clone(ctx), service.clone(), handler);
                session.start();
                entry.insert(Arc::clone(&session) as Arc<dyn ServiceLink>);
                session
            }
        };

        Ok(ServiceServer::new(session, self.inner.self_ref.clone()))
    }

    /// Client for `service`. Each call looks the provider up again.
    pub fn service_client<S: RosService>(&self, service: &str) -> Result<ServiceClient<S>, RnError> {
        self.ensure_running()?;
        let service = resolve_name(service)?;
        Ok(ServiceClient::new(Arc::clone(&self.inner.ctx), service))
    }

    /// Shut down the publisher on `topic`. Returns whether one existed.
    pub async fn unadvertise(&self, topic: &str) -> Result<bool, RnError> {
        let topic = resolve_name(topic)?;
        match self.inner.publishers.remove(&topic) {
            Some((_, link)) => {
                link.shutdown().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<bool, RnError> {
        let topic = resolve_name(topic)?;
        match self.inner.subscribers.remove(&topic) {
            Some((_, link)) => {
                link.shutdown().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn unadvertise_service(&self, service: &str) -> Result<bool, RnError> {
        let service = resolve_name(service)?;
        match self.inner.services.remove(&service) {
            Some((_, link)) => {
                link.shutdown().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn publications(&self) -> Vec<EndpointInfo> {
        self.inner.publications().value
    }

    pub fn subscriptions(&self) -> Vec<EndpointInfo> {
        self.inner.subscriptions().value
    }

    /// Number of subscribers connected to our publisher on `topic`
    pub fn num_subscribers(&self, topic: &str) -> usize {
        resolve_name(topic)
            .ok()
            .and_then(|topic| self.inner.publisher_link(&topic))
            .map(|link| link.num_peers())
            .unwrap_or(0)
    }

    /// Number of publishers our subscriber on `topic` is connected to
    pub fn num_publishers(&self, topic: &str) -> usize {
        resolve_name(topic)
            .ok()
            .and_then(|topic| {
                self.inner
                    .subscribers
                    .get(&topic)
                    .map(|entry| entry.value().num_peers())
            })
            .unwrap_or(0)
    }

    /// Poll the registry until it answers, backing off between attempts.
    ///
    /// Returns the registry's URI, or an error once the node shuts down.
    pub async fn wait_for_master(&self) -> Result<String, RnError> {
        let ctx = &self.inner.ctx;
        let mut backoff = RegistryBackoff::from_config(&ctx.config.master_backoff);

        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(SessionError::Shutdown(ctx.name.clone()).into());
            }

            let result = ctx
                .registry
                .get_uri(&ctx.name)
                .await
                .and_then(RegistryReply::into_result);
            match result {
                Ok(uri) => {
                    tracing::info!("Registry reachable at {}", uri);
                    return Ok(uri);
                }
                Err(e) if backoff.attempts() == 0 => {
                    tracing::warn!(
                        "Unable to reach registry at {}: {}. Will keep trying.",
                        ctx.config.master_uri,
                        e
                    );
                }
                Err(e) => tracing::debug!(
                    "Registry still unreachable after {} attempts: {}",
                    backoff.attempts() + 1,
                    e
                ),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    return Err(SessionError::Shutdown(ctx.name.clone()).into());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Shut every endpoint down, stop the listener and scheduler, and give
    /// up the process slot. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down node {}", self.inner.ctx.name);

        let subscribers: Vec<Arc<dyn SubscriberLink>> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.subscribers.clear();
        futures::future::join_all(subscribers.iter().map(|link| link.shutdown())).await;

        let publishers: Vec<Arc<dyn PublisherLink>> = self
            .inner
            .publishers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.publishers.clear();
        futures::future::join_all(publishers.iter().map(|link| link.shutdown())).await;

        let services: Vec<Arc<dyn ServiceLink>> = self
            .inner
            .services
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.services.clear();
        futures::future::join_all(services.iter().map(|link| link.shutdown())).await;

        self.inner.cancel.cancel();
        self.inner.claim.lock().take();
        tracing::info!("Node {} shut down", self.inner.ctx.name);
    }
}
