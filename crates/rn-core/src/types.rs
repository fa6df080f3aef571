//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RegistryError;

/// Status code meaning success in registry and peer-lookup replies
pub const STATUS_SUCCESS: i32 = 1;
/// Status code for a call that was understood but could not be satisfied
pub const STATUS_FAILURE: i32 = 0;
/// Status code for a malformed or unsupported call
pub const STATUS_ERROR: i32 = -1;

/// Transport protocol name negotiated through `requestTopic`
pub const TCPROS: &str = "TCPROS";

/// `(statusCode, statusMessage, value)` triple returned by every registry call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryReply<T> {
    pub code: i32,
    pub status_message: String,
    pub value: T,
}

impl<T> RegistryReply<T> {
    /// Successful reply
    pub fn success(status_message: impl Into<String>, value: T) -> Self {
        Self {
            code: STATUS_SUCCESS,
            status_message: status_message.into(),
            value,
        }
    }

    /// Reply with an explicit status code
    pub fn with_code(code: i32, status_message: impl Into<String>, value: T) -> Self {
        Self {
            code,
            status_message: status_message.into(),
            value,
        }
    }

    /// Whether `code == 1`
    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    /// Unwrap the value of a successful reply, or turn the status into an error
    pub fn into_result(self) -> Result<T, RegistryError> {
        if self.is_success() {
            Ok(self.value)
        } else {
            Err(RegistryError::Rejected {
                code: self.code,
                message: self.status_message,
            })
        }
    }
}

/// Lifecycle of a publisher, subscriber or service session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Registration with the registry is in flight
    Registering,
    /// The registry accepted the endpoint
    Registered,
    /// Terminal; reachable from either prior state
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Registering => write!(f, "registering"),
            SessionState::Registered => write!(f, "registered"),
            SessionState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Scheduler key for one endpoint, derived from its kind and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl EndpointId {
    /// Create an endpoint ID from a raw string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// ID of the publisher on `topic`
    pub fn publisher(topic: &str) -> Self {
        Self(format!("Publisher://{}", topic))
    }

    /// ID of the subscriber on `topic`
    pub fn subscriber(topic: &str) -> Self {
        Self(format!("Subscriber://{}", topic))
    }

    /// ID of the service provider for `service`
    pub fn service(service: &str) -> Self {
        Self(format!("Service://{}", service))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection target returned by a successful `requestTopic`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicTransport {
    /// Protocol name, always [`TCPROS`] here
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl TopicTransport {
    /// TCPROS target at `host:port`
    pub fn tcpros(host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: TCPROS.to_string(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` string suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split a `scheme://host:port/` URI into host and port.
///
/// Returns `None` when the URI has no explicit port.
pub fn parse_host_port(uri: &str) -> Option<(String, u16)> {
    let rest = match uri.split_once("://") {
        Some((_, rest)) => rest,
        None => uri,
    };
    let authority = rest.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Endpoint name paired with its type, as reported by `publications()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub type_name: String,
}
