//! Inbound handshake routing

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::node::NodeInner;
use crate::session::{PublisherLink, ServiceLink};
use crate::transport::{framed, read_header, reject, InboundConnection};

enum Route {
    Topic(Arc<dyn PublisherLink>),
    Service(Arc<dyn ServiceLink>),
}

/// Read the connection header and hand the socket to the publisher or
/// service it names. Anything else is answered with an `error` header.
pub async fn route_connection(node: Arc<NodeInner>, socket: TcpStream, peer_addr: SocketAddr) {
    let (mut reader, mut writer) = framed(socket);

    let header = match read_header(&mut reader).await {
        Ok(header) => header,
        Err(e) => {
            reject(
                &mut writer,
                peer_addr,
                &format!("unable to read connection header: {}", e),
            )
            .await;
            return;
        }
    };
    tracing::debug!("Connection header from {}: {:?}", peer_addr, header);

    let route = if let Some(topic) = header.topic() {
        node.publisher_link(topic)
            .map(Route::Topic)
            .ok_or_else(|| format!("no publisher for topic {}", topic))
    } else if let Some(service) = header.service() {
        node.service_link(service)
            .map(Route::Service)
            .ok_or_else(|| format!("no provider for service {}", service))
    } else {
        Err("connection header names neither a topic nor a service".to_string())
    };

    match route {
        Ok(route) => {
            let conn = InboundConnection {
                reader,
                writer,
                header,
                peer_addr,
            };
            match route {
                Route::Topic(link) => link.accept(conn).await,
                Route::Service(link) => link.accept(conn).await,
            }
        }
        Err(reason) => reject(&mut writer, peer_addr, &reason).await,
    }
}
