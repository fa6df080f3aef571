//! Registry and peer-lookup collaborator traits
//!
//! The RPC client that talks to a real registry lives outside this
//! workspace. Nodes only see it through [`Registry`] and [`PeerLookup`];
//! the registry and other nodes reach back into a node through
//! [`NodeApi`].

use async_trait::async_trait;
use std::sync::Weak;

use crate::error::RegistryError;
use crate::types::{EndpointInfo, RegistryReply, TopicTransport};

/// Central naming service client
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register a publisher. The reply lists the API URIs of current subscribers.
    async fn register_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<Vec<String>>, RegistryError>;

    async fn unregister_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError>;

    /// Register a subscriber. The reply lists the API URIs of current publishers.
    async fn register_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<Vec<String>>, RegistryError>;

    async fn unregister_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError>;

    /// Register a service provider reachable at `service_uri` (`rosrpc://host:port`)
    async fn register_service(
        &self,
        caller_id: &str,
        service: &str,
        service_uri: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError>;

    async fn unregister_service(
        &self,
        caller_id: &str,
        service: &str,
        service_uri: &str,
    ) -> Result<RegistryReply<i32>, RegistryError>;

    /// Resolve a node name to its API URI
    async fn lookup_node(
        &self,
        caller_id: &str,
        node_name: &str,
    ) -> Result<RegistryReply<String>, RegistryError>;

    /// Resolve a service name to its `rosrpc://` URI
    async fn lookup_service(
        &self,
        caller_id: &str,
        service: &str,
    ) -> Result<RegistryReply<String>, RegistryError>;

    /// URI of the registry itself
    async fn get_uri(&self, caller_id: &str) -> Result<RegistryReply<String>, RegistryError>;

    /// Give the registry a way to call back into a node.
    ///
    /// RPC-backed registries reach nodes over the network and ignore this.
    fn bind_node_api(&self, _api_uri: &str, _api: Weak<dyn NodeApi>) {}
}

/// Point-to-point `requestTopic` call against another node's API
#[async_trait]
pub trait PeerLookup: Send + Sync {
    async fn request_topic(
        &self,
        node_api_uri: &str,
        caller_id: &str,
        topic: &str,
        protocols: &[String],
    ) -> Result<RegistryReply<Option<TopicTransport>>, RegistryError>;
}

/// Calls a node answers on behalf of the registry and its peers
pub trait NodeApi: Send + Sync {
    /// Negotiate a transport for `topic`. Code 1 with a target on success,
    /// 0 for an unknown topic, -1 when no offered protocol is supported.
    fn request_topic(
        &self,
        caller_id: &str,
        topic: &str,
        protocols: &[String],
    ) -> RegistryReply<Option<TopicTransport>>;

    /// The registry's current publisher list for a subscribed topic
    fn publisher_update(
        &self,
        caller_id: &str,
        topic: &str,
        publishers: Vec<String>,
    ) -> RegistryReply<i32>;

    fn publications(&self) -> RegistryReply<Vec<EndpointInfo>>;

    fn subscriptions(&self) -> RegistryReply<Vec<EndpointInfo>>;

    fn master_uri(&self) -> RegistryReply<String>;

    /// Registry-initiated teardown. Replies right away; the node unregisters
    /// its endpoints and stops in the background.
    fn shutdown(&self, caller_id: &str, reason: &str) -> RegistryReply<i32>;

    fn pid(&self) -> RegistryReply<u32> {
        RegistryReply::success("Returning process id", std::process::id())
    }
}
