//! In-process registry
//!
//! Keeps the topic and service graph in memory and calls back into nodes
//! through their [`NodeApi`] instead of over RPC. Useful for single-process
//! graphs and for tests; it also answers `requestTopic` on behalf of the
//! nodes bound to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use rn_core::traits::{NodeApi, PeerLookup, Registry};
use rn_core::types::STATUS_ERROR;
use rn_core::{RegistryError, RegistryReply, TopicTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    caller_id: String,
    caller_api: String,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    caller_id: String,
    service_uri: String,
}

#[derive(Default)]
struct Graph {
    publishers: HashMap<String, Vec<Registration>>,
    subscribers: HashMap<String, Vec<Registration>>,
    services: HashMap<String, ServiceEntry>,
    topic_types: HashMap<String, String>,
    /// caller_id -> API URI
    nodes: HashMap<String, String>,
    /// API URI -> callback surface
    apis: HashMap<String, Weak<dyn NodeApi>>,
}

impl Graph {
    fn publisher_apis(&self, topic: &str) -> Vec<String> {
        self.publishers
            .get(topic)
            .map(|regs| regs.iter().map(|r| r.caller_api.clone()).collect())
            .unwrap_or_default()
    }

    fn subscriber_apis(&self, topic: &str) -> Vec<String> {
        self.subscribers
            .get(topic)
            .map(|regs| regs.iter().map(|r| r.caller_api.clone()).collect())
            .unwrap_or_default()
    }

    fn api(&self, api_uri: &str) -> Option<Arc<dyn NodeApi>> {
        self.apis.get(api_uri).and_then(Weak::upgrade)
    }
}

fn add_registration(list: &mut Vec<Registration>, registration: Registration) {
    if !list.contains(&registration) {
        list.push(registration);
    }
}

fn remove_registration(list: &mut Vec<Registration>, caller_id: &str, caller_api: &str) -> bool {
    let before = list.len();
    list.retain(|r| !(r.caller_id == caller_id && r.caller_api == caller_api));
    list.len() != before
}

/// Registry that lives in this process
pub struct LocalRegistry {
    uri: String,
    graph: Mutex<Graph>,
    reachable: AtomicBool,
}

impl LocalRegistry {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.into(),
            graph: Mutex::new(Graph::default()),
            reachable: AtomicBool::new(true),
        })
    }

    /// Simulate the registry going away or coming back. While unreachable
    /// every call fails with a transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), RegistryError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Transport(format!("{} is not reachable", self.uri)))
        }
    }

    /// API URIs of the publishers registered for `topic`
    pub fn publishers_of(&self, topic: &str) -> Vec<String> {
        self.graph.lock().publisher_apis(topic)
    }

    /// API URIs of the subscribers registered for `topic`
    pub fn subscribers_of(&self, topic: &str) -> Vec<String> {
        self.graph.lock().subscriber_apis(topic)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.graph.lock().services.contains_key(service)
    }

    /// Registered type of `topic`, from its first registration
    pub fn topic_type(&self, topic: &str) -> Option<String> {
        self.graph.lock().topic_types.get(topic).cloned()
    }

    /// Ask a registered node to shut down, as a registry operator would.
    ///
    /// Fails with a transport error when the node is unknown or gone.
    pub fn shutdown_node(
        &self,
        node_name: &str,
        reason: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        let api = {
            let graph = self.graph.lock();
            graph.nodes.get(node_name).and_then(|api_uri| graph.api(api_uri))
        };
        match api {
            Some(api) => Ok(api.shutdown(&self.uri, reason)),
            None => Err(RegistryError::Transport(format!("no live node named {}", node_name))),
        }
    }

    /// Push the current publisher list of `topic` to every subscriber.
    ///
    /// Called with the graph lock released; nodes may call back in.
    fn notify_subscribers(&self, topic: &str) {
        let (publishers, targets) = {
            let graph = self.graph.lock();
            let publishers = graph.publisher_apis(topic);
            let targets: Vec<(String, Option<Arc<dyn NodeApi>>)> = graph
                .subscriber_apis(topic)
                .into_iter()
                .map(|api_uri| {
                    let api = graph.api(&api_uri);
                    (api_uri, api)
                })
                .collect();
            (publishers, targets)
        };

        for (api_uri, api) in targets {
            match api {
                Some(api) => {
                    let reply = api.publisher_update(&self.uri, topic, publishers.clone());
                    if !reply.is_success() {
                        tracing::debug!(
                            "publisherUpdate to {} for {} returned {}: {}",
                            api_uri,
                            topic,
                            reply.code,
                            reply.status_message
                        );
                    }
                }
                None => tracing::debug!("No live node at {} for {}", api_uri, topic),
            }
        }
    }

    fn record_node(graph: &mut Graph, caller_id: &str, caller_api: &str) {
        graph
            .nodes
            .insert(caller_id.to_string(), caller_api.to_string());
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn register_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<Vec<String>>, RegistryError> {
        self.check_reachable()?;
        let subscribers = {
            let mut graph = self.graph.lock();
            Self::record_node(&mut graph, caller_id, caller_api);
            graph
                .topic_types
                .entry(topic.to_string())
                .or_insert_with(|| type_name.to_string());
            add_registration(
                graph.publishers.entry(topic.to_string()).or_default(),
                Registration {
                    caller_id: caller_id.to_string(),
                    caller_api: caller_api.to_string(),
                },
            );
            graph.subscriber_apis(topic)
        };
        tracing::debug!("{} publishes {} ({})", caller_id, topic, type_name);

        self.notify_subscribers(topic);
        Ok(RegistryReply::success(
            format!("Registered [{}] as publisher of [{}]", caller_id, topic),
            subscribers,
        ))
    }

    async fn unregister_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.check_reachable()?;
        let removed = {
            let mut graph = self.graph.lock();
            graph
                .publishers
                .get_mut(topic)
                .map(|list| remove_registration(list, caller_id, caller_api))
                .unwrap_or(false)
        };
        if !removed {
            return Ok(RegistryReply::success(
                format!("[{}] is not a publisher of [{}]", caller_id, topic),
                0,
            ));
        }

        self.notify_subscribers(topic);
        Ok(RegistryReply::success(
            format!("Unregistered [{}] as publisher of [{}]", caller_id, topic),
            1,
        ))
    }

    async fn register_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<Vec<String>>, RegistryError> {
        self.check_reachable()?;
        let mut graph = self.graph.lock();
        Self::record_node(&mut graph, caller_id, caller_api);
        graph
            .topic_types
            .entry(topic.to_string())
            .or_insert_with(|| type_name.to_string());
        add_registration(
            graph.subscribers.entry(topic.to_string()).or_default(),
            Registration {
                caller_id: caller_id.to_string(),
                caller_api: caller_api.to_string(),
            },
        );
        tracing::debug!("{} subscribes to {} ({})", caller_id, topic, type_name);

        Ok(RegistryReply::success(
            format!("Subscribed to [{}]", topic),
            graph.publisher_apis(topic),
        ))
    }

    async fn unregister_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.check_reachable()?;
        let mut graph = self.graph.lock();
        let removed = graph
            .subscribers
            .get_mut(topic)
            .map(|list| remove_registration(list, caller_id, caller_api))
            .unwrap_or(false);
        Ok(RegistryReply::success(
            format!("Unregistered [{}] as subscriber of [{}]", caller_id, topic),
            i32::from(removed),
        ))
    }

    async fn register_service(
        &self,
        caller_id: &str,
        service: &str,
        service_uri: &str,
        caller_api: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.check_reachable()?;
        let mut graph = self.graph.lock();
        Self::record_node(&mut graph, caller_id, caller_api);
        if let Some(previous) = graph.services.insert(
            service.to_string(),
            ServiceEntry {
                caller_id: caller_id.to_string(),
                service_uri: service_uri.to_string(),
            },
        ) {
            if previous.caller_id != caller_id {
                tracing::info!(
                    "Service {} moved from {} to {}",
                    service,
                    previous.caller_id,
                    caller_id
                );
            }
        }
        Ok(RegistryReply::success(
            format!("Registered [{}] as provider of [{}]", caller_id, service),
            1,
        ))
    }

    async fn unregister_service(
        &self,
        caller_id: &str,
        service: &str,
        service_uri: &str,
    ) -> Result<RegistryReply<i32>, RegistryError> {
        self.check_reachable()?;
        let mut graph = self.graph.lock();
        let owned = graph
            .services
            .get(service)
            .map(|entry| entry.service_uri == service_uri)
            .unwrap_or(false);
        if owned {
            graph.services.remove(service);
        }
        Ok(RegistryReply::success(
            format!("Unregistered [{}] as provider of [{}]", caller_id, service),
            i32::from(owned),
        ))
    }

    async fn lookup_node(
        &self,
        _caller_id: &str,
        node_name: &str,
    ) -> Result<RegistryReply<String>, RegistryError> {
        self.check_reachable()?;
        let graph = self.graph.lock();
        Ok(match graph.nodes.get(node_name) {
            Some(api) => RegistryReply::success(format!("node api for [{}]", node_name), api.clone()),
            None => RegistryReply::with_code(
                STATUS_ERROR,
                format!("unknown node [{}]", node_name),
                String::new(),
            ),
        })
    }

    async fn lookup_service(
        &self,
        _caller_id: &str,
        service: &str,
    ) -> Result<RegistryReply<String>, RegistryError> {
        self.check_reachable()?;
        let graph = self.graph.lock();
        Ok(match graph.services.get(service) {
            Some(entry) => RegistryReply::success(
                format!("rosrpc URI: [{}]", entry.service_uri),
                entry.service_uri.clone(),
            ),
            None => RegistryReply::with_code(
                STATUS_ERROR,
                format!("no provider for [{}]", service),
                String::new(),
            ),
        })
    }

    async fn get_uri(&self, _caller_id: &str) -> Result<RegistryReply<String>, RegistryError> {
        self.check_reachable()?;
        Ok(RegistryReply::success("", self.uri.clone()))
    }

    fn bind_node_api(&self, api_uri: &str, api: Weak<dyn NodeApi>) {
        self.graph.lock().apis.insert(api_uri.to_string(), api);
    }
}

#[async_trait]
impl PeerLookup for LocalRegistry {
    async fn request_topic(
        &self,
        node_api_uri: &str,
        caller_id: &str,
        topic: &str,
        protocols: &[String],
    ) -> Result<RegistryReply<Option<TopicTransport>>, RegistryError> {
        let api = self.graph.lock().api(node_api_uri);
        match api {
            Some(api) => Ok(api.request_topic(caller_id, topic, protocols)),
            None => Err(RegistryError::Transport(format!(
                "no node listening at {}",
                node_api_uri
            ))),
        }
    }
}
