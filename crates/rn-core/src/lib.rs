//! rn-core: Core abstractions and configuration for rn nodes
//!
//! This crate provides the shared types, error taxonomy, configuration and
//! collaborator traits used by the node runtime. The registry RPC client
//! and the message code generator live outside this workspace; the traits
//! in [`traits`] and [`message`] are the contracts they fulfil.

pub mod config;
pub mod error;
pub mod message;
pub mod msgs;
pub mod names;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{RnError, RegistryError, ServiceCallError, SessionError};
pub use message::{MessageError, RosMessage, RosService};
pub use types::{EndpointId, EndpointInfo, RegistryReply, SessionState, TopicTransport};
