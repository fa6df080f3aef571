//! Core error types for rn nodes

use rn_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::message::MessageError;

/// Top-level error type for the rn ecosystem
#[derive(Error, Debug)]
pub enum RnError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message (de)serialization error
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registry and peer-lookup call errors
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// The call never produced a reply
    #[error("Registry unreachable: {0}")]
    Transport(String),

    /// The call returned a non-success status code
    #[error("Registry call failed with code {code}: {message}")]
    Rejected {
        /// Status code returned (anything other than 1)
        code: i32,
        /// Status message returned
        message: String,
    },
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// An endpoint with this name exists with a different type
    #[error("{kind} {name} already exists with type {existing}, requested {requested}")]
    TypeMismatch {
        kind: &'static str,
        name: String,
        existing: String,
        requested: String,
    },

    /// The session or node has been shut down
    #[error("Session shut down: {0}")]
    Shutdown(String),

    /// A node already owns this process
    #[error("Node already initialized in this process as {0}")]
    NodeAlreadyInitialized(String),

    /// Invalid node, topic or service name
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// Failures of a single service call, distinguishable by stage
#[derive(Error, Debug)]
pub enum ServiceCallError {
    /// The registry could not resolve the service
    #[error("Service lookup failed: {0}")]
    Lookup(#[from] RegistryError),

    /// The registry returned a provider address we cannot parse
    #[error("Invalid service URI: {0}")]
    InvalidUri(String),

    /// Could not open a connection to the provider
    #[error("Failed to connect to service provider: {0}")]
    Connect(std::io::Error),

    /// The handshake or framing failed
    #[error("Service protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The provider's handler reported a failure
    #[error("Service call failed remotely: {0}")]
    Remote(String),

    /// The request could not be encoded or the response decoded
    #[error("Service message error: {0}")]
    Message(#[from] MessageError),

    /// The client was shut down
    #[error("Service client shut down")]
    Shutdown,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
