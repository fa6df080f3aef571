//! Frame layout
//!
//! Every unit on a peer connection is a frame:
//! - length: 4 bytes (u32, little-endian)
//! - payload: `length` bytes
//!
//! Service responses prepend one status byte to an ordinary frame.
//! A zero-length payload is valid. No maximum frame size is enforced at
//! this layer; the length field itself bounds a payload to `u32::MAX`.

use bytes::{BufMut, BytesMut};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Schema fingerprint / type value that matches anything
pub const WILDCARD: &str = "*";

/// Status byte preceding a service response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    /// The handler failed; the payload is a UTF-8 error message
    Failed = 0,
    /// The handler succeeded; the payload is the serialized response
    Ok = 1,
}

impl ResponseStatus {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8. Only `1` means success.
    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            Self::Ok
        } else {
            Self::Failed
        }
    }

    /// Whether the call succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Append a length-prefixed frame holding `payload` to `dst`
pub fn put_frame(dst: &mut BytesMut, payload: &[u8]) {
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32_le(payload.len() as u32);
    dst.extend_from_slice(payload);
}
