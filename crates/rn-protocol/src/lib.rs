//! rn-protocol: Wire protocol for direct peer connections
//!
//! This crate defines the binary streaming protocol spoken between nodes
//! once the registry has introduced them: length-prefixed frames, the
//! connection header exchanged as the first frame, and the status-prefixed
//! framing used for service responses.

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

pub use codec::{Frame, FrameCodec, ServiceResponse};
pub use error::ProtocolError;
pub use frame::{ResponseStatus, LENGTH_PREFIX_SIZE, WILDCARD};
pub use header::ConnectionHeader;
