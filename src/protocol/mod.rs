//! Sync protocol model.
//!
//! Versioned request/response envelope with one status block per subsystem,
//! each carrying a sequence number and a content hash.

mod envelope;

pub use envelope::*;
