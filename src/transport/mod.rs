//! Transport abstraction.
//!
//! Transports carry sync envelopes between endpoints and the node; the core
//! never sees framing, only decoded requests and encoded responses.

mod registry;

pub use registry::*;
