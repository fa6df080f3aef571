//! Registry implementations shipped with the node runtime

mod local;

pub use local::LocalRegistry;
