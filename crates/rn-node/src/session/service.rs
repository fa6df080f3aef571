//! Service provider and client
//!
//! Both sides are single-shot: a connection carries one handshake, one
//! request frame and one status-prefixed response, then closes. Nothing
//! here goes through the delivery scheduler.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use rn_core::types::parse_host_port;
use rn_core::{RegistryReply, RosMessage, RosService, ServiceCallError, SessionState};
use rn_protocol::header::{validate_service_header, validate_service_reply, FIELD_PROBE};
use rn_protocol::{ConnectionHeader, ProtocolError, ResponseStatus, ServiceResponse};

use super::{EventHub, Lifecycle, SessionEvent, ServiceLink};
use crate::context::NodeContext;
use crate::node::NodeInner;
use crate::transport::{
    close, framed, read_header, reject, send_frame, send_header, FrameReader, FrameWriter,
    InboundConnection,
};

type Handler<S> = Arc<
    dyn Fn(<S as RosService>::Request) -> anyhow::Result<<S as RosService>::Response>
        + Send
        + Sync,
>;

/// Provider state for one service
pub struct ServiceServerSession<S: RosService> {
    ctx: Arc<NodeContext>,
    service: String,
    handler: Handler<S>,
    lifecycle: Lifecycle,
    events: EventHub,
    /// Client connections currently being served
    active: Mutex<HashMap<u64, CancellationToken>>,
    next_client_id: AtomicU64,
}

impl<S: RosService> ServiceServerSession<S> {
    pub(crate) fn new<F>(ctx: Arc<NodeContext>, service: String, handler: F) -> Arc<Self>
    where
        F: Fn(S::Request) -> anyhow::Result<S::Response> + Send + Sync + 'static,
    {
        Arc::new(Self {
            ctx,
            service,
            handler: Arc::new(handler),
            lifecycle: Lifecycle::new(),
            events: EventHub::new(),
            active: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
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
            .register_service(
                &self.ctx.name,
                &self.service,
                &self.ctx.service_uri(),
                &self.ctx.api_uri(),
            )
            .await
            .and_then(RegistryReply::into_result);

        match result {
            Ok(_) => {
                if self.lifecycle.mark_registered() {
                    tracing::info!("Registered service {}", self.service);
                    self.events.emit(SessionEvent::Registered);
                } else {
                    tracing::debug!("Service {} registered after shutdown, ignoring", self.service);
                }
            }
            Err(e) => tracing::error!("Failed to register service {}: {}", self.service, e),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn accept_client(self: Arc<Self>, conn: InboundConnection) {
        let InboundConnection {
            mut reader,
            mut writer,
            header,
            peer_addr,
        } = conn;

        if self.lifecycle.is_shutdown() {
            reject(&mut writer, peer_addr, "service is shutting down").await;
            return;
        }

        if let Err(e) =
            validate_service_header(&header, &self.service, S::type_name(), S::md5sum())
        {
            reject(&mut writer, peer_addr, &e.to_string()).await;
            return;
        }

        let reply = ConnectionHeader::service_reply(&self.ctx.name, S::type_name(), S::md5sum());
        if let Err(e) = send_header(&mut writer, &reply).await {
            tracing::warn!("Failed to answer service client {}: {}", peer_addr, e);
            return;
        }

        if header.probe() {
            tracing::debug!("Service {} probed by {}", self.service, peer_addr);
            close(&mut writer).await;
            return;
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.active.lock().insert(client_id, cancel.clone());
        self.events.emit(SessionEvent::Connected {
            peer: peer_addr.to_string(),
            header,
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Dropping service client {}: service shut down", peer_addr);
            }
            _ = self.serve_one(&mut reader, &mut writer) => {}
        }

        close(&mut writer).await;
        self.active.lock().remove(&client_id);
        self.events.emit(SessionEvent::Disconnected {
            peer: peer_addr.to_string(),
        });
    }

    async fn serve_one(&self, reader: &mut FrameReader, writer: &mut FrameWriter) {
        let request = match reader.next().await {
            Some(Ok(frame)) => frame.payload,
            Some(Err(e)) => {
                tracing::warn!("Error reading request for {}: {}", self.service, e);
                return;
            }
            None => {
                tracing::debug!("Service client for {} left before sending a request", self.service);
                return;
            }
        };

        let response = self.invoke(request);
        if let Err(e) = writer.send(response).await {
            tracing::warn!("Failed to send response for {}: {}", self.service, e);
        }
    }

    fn invoke(&self, request: bytes::Bytes) -> ServiceResponse {
        let request = match S::Request::decode(request) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to deserialize request for {}: {}", self.service, e);
                return ServiceResponse::failed(e.to_string());
            }
        };

        let response = match panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!("Service handler for {} failed: {:#}", self.service, e);
                return ServiceResponse::failed(format!("{:#}", e));
            }
            Err(_) => {
                tracing::error!("Service handler for {} panicked", self.service);
                return ServiceResponse::failed("service handler panicked");
            }
        };

        match response.resolve().to_bytes() {
            Ok(payload) => ServiceResponse::ok(payload),
            Err(e) => {
                tracing::error!("Failed to serialize response for {}: {}", self.service, e);
                ServiceResponse::failed(e.to_string())
            }
        }
    }

    /// Drop in-flight clients and unregister
    pub async fn shutdown(&self) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        tracing::info!("Shutting down service {}", self.service);

        for (_, cancel) in self.active.lock().drain() {
            cancel.cancel();
        }

        let _gate = self.lifecycle.registry_gate().await;
        let result = self
            .ctx
            .registry
            .unregister_service(&self.ctx.name, &self.service, &self.ctx.service_uri())
            .await
            .and_then(RegistryReply::into_result);
        match result {
            Ok(_) => tracing::debug!("Unregistered service {}", self.service),
            Err(e) => tracing::warn!("Failed to unregister service {}: {}", self.service, e),
        }
    }
}

#[async_trait]
impl<S: RosService> ServiceLink for ServiceServerSession<S> {
    fn service(&self) -> &str {
        &self.service
    }

    fn type_name(&self) -> &str {
        S::type_name()
    }

    async fn accept(self: Arc<Self>, conn: InboundConnection) {
        self.accept_client(conn).await;
    }

    async fn shutdown(&self) {
        ServiceServerSession::shutdown(self).await;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Application handle to an advertised service
pub struct ServiceServer<S: RosService> {
    session: Arc<ServiceServerSession<S>>,
    node: Weak<NodeInner>,
}

impl<S: RosService> Clone for ServiceServer<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            node: self.node.clone(),
        }
    }
}

impl<S: RosService> ServiceServer<S> {
    pub(crate) fn new(session: Arc<ServiceServerSession<S>>, node: Weak<NodeInner>) -> Self {
        Self { session, node }
    }

    pub fn service(&self) -> &str {
        self.session.service()
    }

    pub fn type_name(&self) -> &'static str {
        S::type_name()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events()
    }

    /// Stop serving and remove the service from the node
    pub async fn shutdown(&self) {
        if let Some(node) = self.node.upgrade() {
            node.forget_service(&self.session.service, Arc::as_ptr(&self.session) as *const ());
        }
        self.session.shutdown().await;
    }
}

/// Calls a remote service, one connection per call
pub struct ServiceClient<S: RosService> {
    ctx: Arc<NodeContext>,
    service: String,
    closed: AtomicBool,
    _service: PhantomData<fn() -> S>,
}

impl<S: RosService> ServiceClient<S> {
    pub(crate) fn new(ctx: Arc<NodeContext>, service: String) -> Self {
        Self {
            ctx,
            service,
            closed: AtomicBool::new(false),
            _service: PhantomData,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn type_name(&self) -> &'static str {
        S::type_name()
    }

    /// Refuse further calls
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn connect(
        &self,
        header: &ConnectionHeader,
    ) -> Result<(FrameReader, FrameWriter, ConnectionHeader), ServiceCallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServiceCallError::Shutdown);
        }

        let uri = self
            .ctx
            .registry
            .lookup_service(&self.ctx.name, &self.service)
            .await?
            .into_result()?;
        let (host, port) =
            parse_host_port(&uri).ok_or_else(|| ServiceCallError::InvalidUri(uri.clone()))?;

        tracing::debug!("Calling {} at {}:{}", self.service, host, port);
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(ServiceCallError::Connect)?;
        let (mut reader, mut writer) = framed(stream);

        send_header(&mut writer, header).await?;
        let reply = read_header(&mut reader).await?;
        validate_service_reply(&reply, S::md5sum())?;

        Ok((reader, writer, reply))
    }

    /// Check that the provider is reachable and compatible without invoking it
    pub async fn probe(&self) -> Result<ConnectionHeader, ServiceCallError> {
        let header = ConnectionHeader::service_client(&self.ctx.name, &self.service, S::md5sum())
            .with(FIELD_PROBE, "1");
        let (_reader, mut writer, reply) = self.connect(&header).await?;
        close(&mut writer).await;
        Ok(reply)
    }

    /// One request/response round trip
    pub async fn call(&self, request: S::Request) -> Result<S::Response, ServiceCallError> {
        let header = ConnectionHeader::service_client(&self.ctx.name, &self.service, S::md5sum());
        let (mut reader, mut writer, _) = self.connect(&header).await?;

        reader.decoder_mut().set_service_response(true);
        let payload = request.resolve().to_bytes()?;
        send_frame(&mut writer, payload).await?;

        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProtocolError::UnexpectedEof("service response").into()),
        };
        close(&mut writer).await;

        match frame.status {
            Some(ResponseStatus::Ok) => Ok(S::Response::decode(frame.payload)?),
            _ => Err(ServiceCallError::Remote(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
        }
    }
}
