//! Collaborator contracts the core depends on but does not implement.

use super::error::StateReadError;
use super::types::{ContentHash, EndpointKey, Subsystem};

/// One consistent snapshot of a subsystem's server-side state.
///
/// The delta engine reads exactly one snapshot per subsystem per request, so
/// concurrent server-side updates can never produce a torn response mixing
/// old and new state within one subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemSnapshot {
    /// Monotonically non-decreasing sequence number of the state.
    pub seq: u64,
    /// Content hash of the payload.
    pub hash: ContentHash,
    /// Schema describing the payload (shipped on RESYNC).
    pub schema: Vec<u8>,
    /// Full state payload.
    pub payload: Vec<u8>,
}

impl SubsystemSnapshot {
    /// Build a snapshot from a payload, hashing it.
    pub fn new(seq: u64, schema: Vec<u8>, payload: Vec<u8>) -> Self {
        let hash = ContentHash::of(&payload);
        Self {
            seq,
            hash,
            schema,
            payload,
        }
    }
}

/// Read contract of the configuration/notification store.
///
/// The core has no opinion on the underlying storage engine; any source that
/// can answer with a consistent `(seq, hash, payload)` triple qualifies.
pub trait StateReader: Send + Sync + 'static {
    /// Current state of one subsystem for one endpoint.
    fn current_state(
        &self,
        endpoint: &EndpointKey,
        subsystem: Subsystem,
    ) -> Result<SubsystemSnapshot, StateReadError>;
}
