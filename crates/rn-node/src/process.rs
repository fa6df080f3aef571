//! Process-wide node context
//!
//! At most one node per process may be created through [`init_node`]. The
//! slot is released when that node shuts down, after which a new node may
//! be initialized.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use rn_core::config::NodeConfig;
use rn_core::traits::{PeerLookup, Registry};
use rn_core::{RnError, SessionError};

use crate::node::{resolve_node_name, Node};

static ACTIVE_NODE: Mutex<Option<String>> = parking_lot::const_mutex(None);

/// Ownership of the process slot; dropping it frees the slot
pub struct ProcessClaim {
    name: String,
}

impl ProcessClaim {
    pub fn acquire(name: &str) -> Result<Self, SessionError> {
        let mut active = ACTIVE_NODE.lock();
        if let Some(existing) = active.as_ref() {
            return Err(SessionError::NodeAlreadyInitialized(existing.clone()));
        }
        *active = Some(name.to_string());
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ProcessClaim {
    fn drop(&mut self) {
        let mut active = ACTIVE_NODE.lock();
        if active.as_deref() == Some(self.name.as_str()) {
            *active = None;
        }
    }
}

/// Name of the node currently holding the process slot
pub fn active_node_name() -> Option<String> {
    ACTIVE_NODE.lock().clone()
}

/// Create the process's node.
///
/// Fails with [`SessionError::NodeAlreadyInitialized`] while another node
/// created this way is still running.
pub async fn init_node(
    name: &str,
    config: NodeConfig,
    registry: Arc<dyn Registry>,
    peer_lookup: Arc<dyn PeerLookup>,
) -> Result<Node, RnError> {
    let name = resolve_node_name(name, &config)?;
    let claim = ProcessClaim::acquire(&name)?;
    let node = Node::start_resolved(name, config, registry, peer_lookup).await?;
    node.attach_claim(claim);
    Ok(node)
}

/// Shut `node` down on Ctrl+C or SIGTERM
pub fn shutdown_on_signal(node: Node) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        node.shutdown().await;
    })
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
