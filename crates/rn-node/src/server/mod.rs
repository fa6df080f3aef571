//! Peer listener
//!
//! One TCP listener per node carries every inbound subscriber and service
//! client connection. The connection header decides where it goes.

mod handler;
mod listener;

pub use handler::route_connection;
pub use listener::PeerListener;
