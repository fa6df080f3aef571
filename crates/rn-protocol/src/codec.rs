//! Tokio codec for length-prefixed frames
//!
//! The decoder reassembles payloads from arbitrarily chunked input: the
//! length prefix may be split across reads, and a single read may carry
//! several frames. Each payload is yielded exactly once, in arrival order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{put_frame, ResponseStatus, LENGTH_PREFIX_SIZE};

/// Upper bound on buffer growth per decode call while a payload is incomplete
const MAX_RESERVE: usize = 64 * 1024;

/// One reassembled frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload, without the length prefix
    pub payload: Bytes,
    /// Status byte that preceded the frame (service-response mode only)
    pub status: Option<ResponseStatus>,
}

impl Frame {
    /// Create a plain frame
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            status: None,
        }
    }
}

/// A service reply: status byte followed by one ordinary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Whether the remote handler succeeded
    pub status: ResponseStatus,
    /// Serialized response, or a UTF-8 error message on failure
    pub payload: Bytes,
}

impl ServiceResponse {
    /// Successful response carrying a serialized message
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            payload: payload.into(),
        }
    }

    /// Failed response carrying an error message
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            payload: Bytes::from(message.into()),
        }
    }
}

/// Codec for encoding/decoding frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload length of the frame being assembled (set once the prefix is read)
    expected_len: Option<usize>,
    /// Status byte already consumed for the frame being assembled
    pending_status: Option<u8>,
    /// Treat the byte before each length prefix as a service status byte
    service_response: bool,
}

impl FrameCodec {
    /// Create a new codec in normal mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that decodes service responses
    pub fn service_response() -> Self {
        Self {
            service_response: true,
            ..Self::default()
        }
    }

    /// Switch service-response decoding on or off.
    ///
    /// Takes effect at the next frame boundary; a frame already in progress
    /// finishes under the mode it started with.
    pub fn set_service_response(&mut self, enabled: bool) {
        self.service_response = enabled;
    }

    /// Whether service-response decoding is enabled
    pub fn is_service_response(&self) -> bool {
        self.service_response
    }

    fn in_progress(&self) -> bool {
        self.expected_len.is_some() || self.pending_status.is_some()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Status byte comes first, and may arrive alone
        if self.service_response && !self.in_progress() {
            if src.is_empty() {
                return Ok(None);
            }
            self.pending_status = Some(src.get_u8());
        }

        let payload_len = match self.expected_len {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = src.get_u32_le() as usize;
                self.expected_len = Some(len);
                len
            }
        };

        if src.len() < payload_len {
            // The length is unchecked peer input; grow with the data instead
            src.reserve((payload_len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        self.expected_len = None;
        let status = self.pending_status.take().map(ResponseStatus::from_u8);

        tracing::trace!("Decoded frame of {} bytes", payload_len);

        Ok(Some(Frame { payload, status }))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(dst, &payload);
        Ok(())
    }
}

impl Encoder<ServiceResponse> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, response: ServiceResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(1);
        dst.put_u8(response.status.as_u8());
        put_frame(dst, &response.payload);
        Ok(())
    }
}
