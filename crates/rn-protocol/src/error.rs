//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A header sub-field could not be parsed
    #[error("Malformed connection header: {0}")]
    MalformedHeader(String),

    /// A field required for this role is absent
    #[error("Connection header missing expected field [{0}]")]
    MissingField(&'static str),

    /// The peer's header does not match the local endpoint
    #[error("Connection header mismatch: {0}")]
    Mismatch(String),

    /// The peer answered our header with an `error` field
    #[error("Peer rejected connection: {0}")]
    PeerRejected(String),

    /// The stream ended before an expected frame arrived
    #[error("Connection closed while waiting for {0}")]
    UnexpectedEof(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error came from validating a peer's header, as opposed
    /// to a transport failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedHeader(_)
                | ProtocolError::MissingField(_)
                | ProtocolError::Mismatch(_)
        )
    }
}
