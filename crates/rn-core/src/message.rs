//! Message and service schema contracts
//!
//! Generated message types implement [`RosMessage`]; generated service
//! definitions implement [`RosService`]. The serialization is the ROS
//! little-endian layout: fixed-width integers, strings as a u32 length
//! followed by UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Message (de)serialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The buffer ended before a field was complete
    #[error("Message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A string field held invalid UTF-8
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    /// Any other schema-specific failure
    #[error("{0}")]
    Custom(String),
}

/// A serializable message type
pub trait RosMessage: Clone + Send + Sync + 'static {
    /// Fully qualified type name, e.g. `std_msgs/String`
    fn type_name() -> &'static str;

    /// Schema fingerprint
    fn md5sum() -> &'static str;

    /// Append the serialized message to `buf`
    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError>;

    /// Parse a message from a frame payload
    fn decode(buf: Bytes) -> Result<Self, MessageError>;

    /// Fill in defaulted fields before serialization
    fn resolve(self) -> Self {
        self
    }

    /// Serialize into a fresh buffer
    fn to_bytes(&self) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// A request/response service definition
pub trait RosService: Send + Sync + 'static {
    type Request: RosMessage;
    type Response: RosMessage;

    /// Fully qualified service type name
    fn type_name() -> &'static str;

    /// Schema fingerprint shared by request and response
    fn md5sum() -> &'static str;
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), MessageError> {
    if buf.remaining() < needed {
        return Err(MessageError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Append a length-prefixed UTF-8 string
pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

/// Read a length-prefixed UTF-8 string
pub fn get_string(buf: &mut Bytes) -> Result<String, MessageError> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MessageError::InvalidUtf8)
}

/// Read a little-endian i32
pub fn get_i32(buf: &mut Bytes) -> Result<i32, MessageError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

/// Read a little-endian i64
pub fn get_i64(buf: &mut Bytes) -> Result<i64, MessageError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hi");
        assert_eq!(&buf[..], &[2, 0, 0, 0, b'h', b'i']);

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "hi");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_truncated_string() {
        let mut bytes = Bytes::from_static(&[5, 0, 0, 0, b'a']);
        assert_eq!(
            get_string(&mut bytes),
            Err(MessageError::Truncated {
                needed: 5,
                remaining: 1
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = Bytes::from_static(&[1, 0, 0, 0, 0xff]);
        assert_eq!(get_string(&mut bytes), Err(MessageError::InvalidUtf8));
    }

    #[test]
    fn test_short_integer() {
        let mut bytes = Bytes::from_static(&[1, 2]);
        assert!(get_i32(&mut bytes).is_err());
    }
}
