//! Framed peer connections
//!
//! Every peer socket is split into a framed reader and a framed writer
//! sharing [`FrameCodec`]. The first frame in each direction is a
//! connection header.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use rn_protocol::{ConnectionHeader, FrameCodec, ProtocolError};

pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Split a socket into framed halves
pub fn framed(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, FrameCodec::new()),
        FramedWrite::new(write, FrameCodec::new()),
    )
}

/// An accepted connection whose header has been read
pub struct InboundConnection {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    pub header: ConnectionHeader,
    pub peer_addr: SocketAddr,
}

/// Read the next frame as a connection header
pub async fn read_header(reader: &mut FrameReader) -> Result<ConnectionHeader, ProtocolError> {
    match reader.next().await {
        Some(Ok(frame)) => ConnectionHeader::decode(&frame.payload),
        Some(Err(e)) => Err(e),
        None => Err(ProtocolError::UnexpectedEof("connection header")),
    }
}

/// Write a connection header frame
pub async fn send_header(
    writer: &mut FrameWriter,
    header: &ConnectionHeader,
) -> Result<(), ProtocolError> {
    writer.send(header.encode()).await
}

/// Write a single data frame
pub async fn send_frame(writer: &mut FrameWriter, payload: Bytes) -> Result<(), ProtocolError> {
    writer.send(payload).await
}

/// Tell the peer why its connection is refused, then close our side
pub async fn reject(writer: &mut FrameWriter, peer: SocketAddr, reason: &str) {
    tracing::warn!("Rejecting connection from {}: {}", peer, reason);
    if let Err(e) = send_header(writer, &ConnectionHeader::rejection(reason)).await {
        tracing::debug!("Failed to send rejection to {}: {}", peer, e);
    }
    close(writer).await;
}

/// Flush and shut down the write half
pub async fn close(writer: &mut FrameWriter) {
    let _ = SinkExt::<Bytes>::close(writer).await;
}

/// Toggle Nagle's algorithm on the socket behind a writer
pub fn set_nodelay(writer: &FrameWriter, nodelay: bool) {
    if let Err(e) = writer.get_ref().as_ref().set_nodelay(nodelay) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }
}
