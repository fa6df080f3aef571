//! Hand-written message types
//!
//! A few common definitions, written out the way the code generator
//! would emit them, so nodes can talk without generated packages.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{get_i32, get_i64, get_string, put_string, MessageError, RosMessage, RosService};
use rn_protocol::WILDCARD;

/// `std_msgs/String`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdString {
    pub data: String,
}

impl StdString {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl RosMessage for StdString {
    fn type_name() -> &'static str {
        "std_msgs/String"
    }

    fn md5sum() -> &'static str {
        "992ce8a1687cec8c8bd883ec73ca41d1"
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        put_string(buf, &self.data);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<Self, MessageError> {
        Ok(Self {
            data: get_string(&mut buf)?,
        })
    }
}

/// `std_msgs/Int32`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int32 {
    pub data: i32,
}

impl RosMessage for Int32 {
    fn type_name() -> &'static str {
        "std_msgs/Int32"
    }

    fn md5sum() -> &'static str {
        "da5909fbe378aeaf85e547e830cc1bb7"
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        buf.put_i32_le(self.data);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<Self, MessageError> {
        Ok(Self {
            data: get_i32(&mut buf)?,
        })
    }
}

/// Opaque payload of any type.
///
/// Advertises the wildcard type and fingerprint, so it can attach to any
/// topic without knowing the schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage(pub Bytes);

impl RosMessage for RawMessage {
    fn type_name() -> &'static str {
        WILDCARD
    }

    fn md5sum() -> &'static str {
        WILDCARD
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        buf.extend_from_slice(&self.0);
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<Self, MessageError> {
        Ok(Self(buf))
    }
}

/// `rospy_tutorials/AddTwoInts`
pub struct AddTwoInts;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddTwoIntsRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddTwoIntsResponse {
    pub sum: i64,
}

impl RosService for AddTwoInts {
    type Request = AddTwoIntsRequest;
    type Response = AddTwoIntsResponse;

    fn type_name() -> &'static str {
        "rospy_tutorials/AddTwoInts"
    }

    fn md5sum() -> &'static str {
        "6a2e34150c00229791cc89ff309fff21"
    }
}

impl RosMessage for AddTwoIntsRequest {
    fn type_name() -> &'static str {
        "rospy_tutorials/AddTwoIntsRequest"
    }

    fn md5sum() -> &'static str {
        "36d09b846be0b371c5f190354dd3153e"
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        buf.put_i64_le(self.a);
        buf.put_i64_le(self.b);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<Self, MessageError> {
        let a = get_i64(&mut buf)?;
        let b = get_i64(&mut buf)?;
        Ok(Self { a, b })
    }
}

impl RosMessage for AddTwoIntsResponse {
    fn type_name() -> &'static str {
        "rospy_tutorials/AddTwoIntsResponse"
    }

    fn md5sum() -> &'static str {
        "b88405221c77b1878a3cbbfff53428d7"
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        buf.put_i64_le(self.sum);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<Self, MessageError> {
        Ok(Self {
            sum: get_i64(&mut buf)?,
        })
    }
}
