//! rn-node: Node runtime for a ROS-style publish/subscribe graph
//!
//! A node advertises publishers and services and subscribes to topics.
//! Endpoints are registered with a central registry, peers are found
//! through it, and data flows over direct TCPROS connections between
//! nodes. Outgoing and incoming messages pass through a per-node
//! [`scheduler::DeliveryScheduler`] that bounds and throttles delivery.

pub mod backoff;
pub mod context;
pub mod node;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

pub use node::Node;
pub use process::{init_node, shutdown_on_signal};
pub use registry::LocalRegistry;
pub use session::{
    AdvertiseOptions, Publisher, ServiceClient, ServiceServer, SessionEvent, SubscribeOptions,
    Subscriber,
};
