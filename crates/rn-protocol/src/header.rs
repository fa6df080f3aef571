//! Connection header encoding, decoding and validation
//!
//! The header is the first frame on every new peer connection. Its payload
//! is a sequence of sub-frames, each a little-endian u32 length followed by
//! UTF-8 `name=value` bytes. The field count is implied by consuming
//! sub-frames until the payload is exhausted.
//!
//! # Fields by role
//!
//! | Role            | Fields sent                                   |
//! |-----------------|-----------------------------------------------|
//! | subscriber      | `callerid`, `md5sum`, `topic`, `type`         |
//! | publisher reply | `callerid`, `latching`, `md5sum`, `type`      |
//! | service client  | `callerid`, `md5sum`, `service`               |
//! | service reply   | `callerid`, `md5sum`, `type`                  |
//! | rejection       | `error`                                       |

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::frame::{put_frame, LENGTH_PREFIX_SIZE, WILDCARD};

pub const FIELD_CALLER_ID: &str = "callerid";
pub const FIELD_TOPIC: &str = "topic";
pub const FIELD_SERVICE: &str = "service";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_MD5SUM: &str = "md5sum";
pub const FIELD_LATCHING: &str = "latching";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_PROBE: &str = "probe";
pub const FIELD_TCP_NODELAY: &str = "tcp_nodelay";

/// Ordered `name -> value` mapping exchanged when a connection opens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: Vec<(String, String)>,
}

impl ConnectionHeader {
    /// Create an empty header
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a field, replacing an existing value in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Look up a field
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a field is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn topic(&self) -> Option<&str> {
        self.get(FIELD_TOPIC)
    }

    pub fn service(&self) -> Option<&str> {
        self.get(FIELD_SERVICE)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.get(FIELD_TYPE)
    }

    pub fn md5sum(&self) -> Option<&str> {
        self.get(FIELD_MD5SUM)
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.get(FIELD_CALLER_ID)
    }

    pub fn error(&self) -> Option<&str> {
        self.get(FIELD_ERROR)
    }

    /// Publisher replies carry `latching=1` when the topic latches
    pub fn latching(&self) -> bool {
        self.get(FIELD_LATCHING) == Some("1")
    }

    /// Service clients may only probe the connection
    pub fn probe(&self) -> bool {
        self.get(FIELD_PROBE) == Some("1")
    }

    /// Header a subscriber sends when it connects to a publisher
    pub fn subscriber(caller_id: &str, topic: &str, type_name: &str, md5sum: &str) -> Self {
        Self::new()
            .with(FIELD_CALLER_ID, caller_id)
            .with(FIELD_MD5SUM, md5sum)
            .with(FIELD_TOPIC, topic)
            .with(FIELD_TYPE, type_name)
    }

    /// Header a publisher answers an accepted subscriber with
    pub fn publisher_reply(caller_id: &str, type_name: &str, md5sum: &str, latching: bool) -> Self {
        Self::new()
            .with(FIELD_CALLER_ID, caller_id)
            .with(FIELD_LATCHING, if latching { "1" } else { "0" })
            .with(FIELD_MD5SUM, md5sum)
            .with(FIELD_TYPE, type_name)
    }

    /// Header a service client opens a call with
    pub fn service_client(caller_id: &str, service: &str, md5sum: &str) -> Self {
        Self::new()
            .with(FIELD_CALLER_ID, caller_id)
            .with(FIELD_MD5SUM, md5sum)
            .with(FIELD_SERVICE, service)
    }

    /// Header a service provider answers an accepted client with
    pub fn service_reply(caller_id: &str, type_name: &str, md5sum: &str) -> Self {
        Self::new()
            .with(FIELD_CALLER_ID, caller_id)
            .with(FIELD_MD5SUM, md5sum)
            .with(FIELD_TYPE, type_name)
    }

    /// Header sent in place of a reply when a connection is rejected
    pub fn rejection(reason: impl Into<String>) -> Self {
        Self::new().with(FIELD_ERROR, reason)
    }

    /// Serialize into a frame payload (the outer length prefix is added by
    /// the codec when the payload is written).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for (name, value) in &self.fields {
            let field = format!("{}={}", name, value);
            put_frame(&mut buf, field.as_bytes());
        }
        buf.freeze()
    }

    /// Parse a header frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut src = payload;
        let mut header = Self::new();

        while src.has_remaining() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Err(ProtocolError::MalformedHeader(format!(
                    "{} trailing bytes cannot hold a field length",
                    src.len()
                )));
            }
            let len = src.get_u32_le() as usize;
            if src.len() < len {
                return Err(ProtocolError::MalformedHeader(format!(
                    "field claims {} bytes but only {} remain",
                    len,
                    src.len()
                )));
            }
            let (field, rest) = src.split_at(len);
            src = rest;

            let field = std::str::from_utf8(field)
                .map_err(|_| ProtocolError::MalformedHeader("field is not UTF-8".into()))?;
            let (name, value) = field.split_once('=').ok_or_else(|| {
                ProtocolError::MalformedHeader(format!("field '{}' has no '='", field))
            })?;
            header.insert(name, value);
        }

        Ok(header)
    }
}

fn require<'a>(header: &'a ConnectionHeader, field: &'static str) -> Result<&'a str, ProtocolError> {
    header.get(field).ok_or(ProtocolError::MissingField(field))
}

fn wildcard_match(remote: &str, local: &str) -> bool {
    remote == local || remote == WILDCARD || local == WILDCARD
}

fn check_type_and_md5(
    header: &ConnectionHeader,
    type_name: &str,
    md5sum: &str,
) -> Result<(), ProtocolError> {
    let remote_type = require(header, FIELD_TYPE)?;
    let remote_md5 = require(header, FIELD_MD5SUM)?;

    if !wildcard_match(remote_type, type_name) {
        return Err(ProtocolError::Mismatch(format!(
            "got type {} but expected {}",
            remote_type, type_name
        )));
    }
    if !wildcard_match(remote_md5, md5sum) {
        return Err(ProtocolError::Mismatch(format!(
            "got md5sum {} but expected {}",
            remote_md5, md5sum
        )));
    }
    Ok(())
}

/// Validate a subscriber's header against a local publisher
pub fn validate_subscriber_header(
    header: &ConnectionHeader,
    topic: &str,
    type_name: &str,
    md5sum: &str,
) -> Result<(), ProtocolError> {
    let remote_topic = require(header, FIELD_TOPIC)?;
    if remote_topic != topic {
        return Err(ProtocolError::Mismatch(format!(
            "got topic {} but expected {}",
            remote_topic, topic
        )));
    }
    check_type_and_md5(header, type_name, md5sum)
}

/// Validate a publisher's reply header against a local subscriber
pub fn validate_publisher_header(
    header: &ConnectionHeader,
    type_name: &str,
    md5sum: &str,
) -> Result<(), ProtocolError> {
    check_type_and_md5(header, type_name, md5sum)
}

/// Validate a service client's header against a local service provider.
///
/// Clients are not required to send `type`; when present it is checked.
pub fn validate_service_header(
    header: &ConnectionHeader,
    service: &str,
    type_name: &str,
    md5sum: &str,
) -> Result<(), ProtocolError> {
    let remote_service = require(header, FIELD_SERVICE)?;
    if remote_service != service {
        return Err(ProtocolError::Mismatch(format!(
            "got service {} but expected {}",
            remote_service, service
        )));
    }
    let remote_md5 = require(header, FIELD_MD5SUM)?;
    if !wildcard_match(remote_md5, md5sum) {
        return Err(ProtocolError::Mismatch(format!(
            "got md5sum {} but expected {}",
            remote_md5, md5sum
        )));
    }
    match header.type_name() {
        Some(remote_type) if !wildcard_match(remote_type, type_name) => Err(
            ProtocolError::Mismatch(format!("got type {} but expected {}", remote_type, type_name)),
        ),
        _ => Ok(()),
    }
}

/// Validate a service provider's reply header against a local client
pub fn validate_service_reply(header: &ConnectionHeader, md5sum: &str) -> Result<(), ProtocolError> {
    if let Some(reason) = header.error() {
        return Err(ProtocolError::PeerRejected(reason.to_string()));
    }
    let remote_md5 = require(header, FIELD_MD5SUM)?;
    if !wildcard_match(remote_md5, md5sum) {
        return Err(ProtocolError::Mismatch(format!(
            "got md5sum {} but expected {}",
            remote_md5, md5sum
        )));
    }
    Ok(())
}
