//! Accept loop for the node's peer port

use std::net::SocketAddr;
use std::sync::Weak;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::node::NodeInner;
use crate::server::handler::route_connection;

/// Accepts peer connections and routes each one on its own task
pub struct PeerListener {
    listener: TcpListener,
    /// The listener must not keep its node alive
    node: Weak<NodeInner>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl PeerListener {
    pub fn new(listener: TcpListener, node: Weak<NodeInner>, cancel: CancellationToken) -> Self {
        Self {
            listener,
            node,
            cancel,
        }
    }

    /// Run until cancelled
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Peer listener on {}", addr),
            Err(e) => tracing::warn!("Peer listener address unavailable: {}", e),
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Peer listener shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New connection from {}", peer_addr);

        let Some(node) = self.node.upgrade() else {
            tracing::debug!("Node gone, dropping connection from {}", peer_addr);
            return;
        };
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                }
                _ = route_connection(node, socket, peer_addr) => {}
            }
        });
    }
}
