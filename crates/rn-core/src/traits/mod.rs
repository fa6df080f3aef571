//! Core trait definitions

mod registry;

pub use registry::{NodeApi, PeerLookup, Registry};
