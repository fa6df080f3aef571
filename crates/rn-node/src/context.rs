//! State shared by a node and every session it owns

use std::sync::Arc;

use rn_core::config::NodeConfig;
use rn_core::traits::{PeerLookup, Registry};

use crate::scheduler::DeliveryScheduler;
use crate::session::Payload;

/// Identity, collaborators and scheduler of one node
pub struct NodeContext {
    /// Slash-rooted node name, sent as `callerid`
    pub name: String,
    /// Host peers use to reach this node
    pub host: String,
    /// Port of the peer listener
    pub port: u16,
    pub config: NodeConfig,
    pub registry: Arc<dyn Registry>,
    pub peer_lookup: Arc<dyn PeerLookup>,
    pub scheduler: DeliveryScheduler<Payload>,
}

impl NodeContext {
    /// URI under which the registry knows this node
    pub fn api_uri(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }

    /// URI service clients connect to
    pub fn service_uri(&self) -> String {
        format!("rosrpc://{}:{}", self.host, self.port)
    }
}
