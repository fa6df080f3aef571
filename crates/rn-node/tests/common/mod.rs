//! Shared helpers for node integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use rn_core::config::{BackoffConfig, NodeConfig};
use rn_core::traits::{NodeApi, Registry};
use rn_core::{RegistryError, RegistryReply};
use rn_node::{LocalRegistry, Node};

/// Loopback-only config with a fast registry backoff
pub fn test_config() -> NodeConfig {
    NodeConfig {
        master_uri: "local://registry".to_string(),
        bind_address: "127.0.0.1".to_string(),
        tcpros_port: 0,
        advertised_host: Some("127.0.0.1".to_string()),
        master_backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..NodeConfig::default()
    }
}

pub fn registry() -> Arc<LocalRegistry> {
    LocalRegistry::new("local://registry")
}

pub async fn start_node(name: &str, registry: &Arc<LocalRegistry>) -> Node {
    Node::start(name, test_config(), registry.clone(), registry.clone())
        .await
        .unwrap()
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Forwards to a `LocalRegistry` but parks every register call until
/// `release` is called
pub struct HeldRegistry {
    inner: Arc<LocalRegistry>,
    release: Semaphore,
    waiting: AtomicUsize,
}

impl HeldRegistry {
    pub fn new(inner: &Arc<LocalRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::clone(inner),
            release: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Register calls currently parked
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Let parked and future register calls through
    pub fn release(&self) {
        self.release.add_permits(1024);
    }

    async fn hold(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Registry for HeldRegistry {
    async fn register_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<Vec<String>>, RegistryError> {
        self.hold().await;
        self.inner
            .register_publisher(caller_id, topic, type_name, caller_api)
            .await
    }

    async fn unregister_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.inner.unregister_publisher(caller_id, topic, caller_api).await
    }

    async fn register_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<Vec<String>>, RegistryError> {
        self.hold().await;
        self.inner
            .register_subscriber(caller_id, topic, type_name, caller_api)
            .await
    }

    async fn unregister_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.inner.unregister_subscriber(caller_id, topic, caller_api).await
    }

    async fn register_service(
        &self,
        caller_id: &str,
        service: &str,
        service_uri: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.hold().await;
        self.inner
            .register_service(caller_id, service, service_uri, caller_api)
            .await
    }

    async fn unregister_service(
        &self,
        caller_id: &str,
        service: &str,
        service_uri: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.inner.unregister_service(caller_id, service, service_uri).await
    }

    async fn lookup_node(
        &self,
        caller_id: &str,
        node_name: &str,
    ) -> Result<RegistryReply<String>, RegistryError> {
        self.inner.lookup_node(caller_id, node_name).await
    }

    async fn lookup_service(
        &self,
        caller_id: &str,
        service: &str,
    ) -> Result<RegistryReply<String>, RegistryError> {
        self.inner.lookup_service(caller_id, service).await
    }

    async fn get_uri(&self, caller_id: &str) -> Result<RegistryReply<String>, RegistryError> {
        self.inner.get_uri(caller_id).await
    }

    fn bind_node_api(&self, api_uri: &str, api: Weak<dyn NodeApi>) {
        self.inner.bind_node_api(api_uri, api);
    }
}

pub async fn start_held_node(
    name: &str,
    held: &Arc<HeldRegistry>,
    registry: &Arc<LocalRegistry>,
) -> Node {
    Node::start(name, test_config(), held.clone(), registry.clone())
        .await
        .unwrap()
}
