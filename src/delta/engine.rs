//! Delta/resync decision engine.
//!
//! Given a subsystem's client-declared state, the session's last-served state
//! (the delta horizon), and one consistent snapshot of current server state,
//! decides NO_DELTA / DELTA / RESYNC and produces the payload.
//!
//! The engine is pure: the same inputs always produce the same block, which
//! is what makes `process_sync` deterministic end to end.

use thiserror::Error;

use crate::core::{ContentHash, SubsystemSnapshot};
use crate::protocol::{ClientSubsystemState, SubsystemStatus};

/// The last state a session served for one subsystem.
///
/// This is the delta horizon: exactly one step of history. A client whose
/// declared hash is older than this cannot be served an incremental path and
/// falls back to RESYNC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedState {
    /// Sequence number of the served state.
    pub seq: u64,
    /// Content hash of the served payload.
    pub hash: ContentHash,
    /// The served payload, kept for diff computation.
    pub payload: Vec<u8>,
}

impl ServedState {
    /// Record a snapshot as the new horizon.
    pub fn from_snapshot(snapshot: &SubsystemSnapshot) -> Self {
        Self {
            seq: snapshot.seq,
            hash: snapshot.hash.clone(),
            payload: snapshot.payload.clone(),
        }
    }
}

/// Decide the status block for one subsystem.
///
/// Rules, in order:
/// 1. no prior session state: RESYNC regardless of client flags (first contact);
/// 2. client requested resync-only: RESYNC;
/// 3. declared seq + hash match current: NO_DELTA, no payload;
/// 4. declared hash matches the horizon: DELTA from horizon to current;
/// 5. otherwise: RESYNC (declared state predates the horizon).
pub fn evaluate(
    prior: Option<&ServedState>,
    declared: &ClientSubsystemState,
    current: &SubsystemSnapshot,
) -> SubsystemStatus {
    let subsystem = declared.subsystem;

    let Some(prior) = prior else {
        return resync_block(declared, current);
    };

    if declared.resync_only {
        return resync_block(declared, current);
    }

    if declared.seq == current.seq && declared.hash.as_ref() == Some(&current.hash) {
        return SubsystemStatus::no_delta(subsystem, current.seq);
    }

    if declared.hash.as_ref() == Some(&prior.hash) {
        let delta = SpliceDelta::between(&prior.payload, &current.payload);
        return SubsystemStatus::delta(subsystem, current.seq, delta.encode());
    }

    resync_block(declared, current)
}

fn resync_block(declared: &ClientSubsystemState, current: &SubsystemSnapshot) -> SubsystemStatus {
    SubsystemStatus::resync(
        declared.subsystem,
        current.seq,
        current.schema.clone(),
        current.payload.clone(),
    )
}

/// Splice-encoded delta between two payloads.
///
/// The longest common prefix and suffix of the prior and current payloads are
/// kept; only the middle is shipped. Reconstruction splices the replacement
/// into the prior payload.
///
/// Wire format:
/// ```text
/// +0  Prefix Length (4 bytes LE32)
/// +4  Suffix Length (4 bytes LE32)
/// +8  Replacement (variable)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceDelta {
    /// Bytes of the prior payload kept at the front.
    pub prefix_len: u32,
    /// Bytes of the prior payload kept at the back.
    pub suffix_len: u32,
    /// Bytes replacing the middle.
    pub replacement: Vec<u8>,
}

/// Splice header size in bytes.
pub const SPLICE_HEADER_SIZE: usize = 8;

impl SpliceDelta {
    /// Compute the delta transforming `prior` into `current`.
    pub fn between(prior: &[u8], current: &[u8]) -> Self {
        let max_common = prior.len().min(current.len());

        let mut prefix_len = 0;
        while prefix_len < max_common && prior[prefix_len] == current[prefix_len] {
            prefix_len += 1;
        }

        let mut suffix_len = 0;
        while suffix_len < max_common - prefix_len
            && prior[prior.len() - 1 - suffix_len] == current[current.len() - 1 - suffix_len]
        {
            suffix_len += 1;
        }

        Self {
            prefix_len: prefix_len as u32,
            suffix_len: suffix_len as u32,
            replacement: current[prefix_len..current.len() - suffix_len].to_vec(),
        }
    }

    /// Reconstruct the current payload from the prior payload.
    pub fn apply(&self, prior: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let prefix_len = self.prefix_len as usize;
        let suffix_len = self.suffix_len as usize;
        if prefix_len + suffix_len > prior.len() {
            return Err(DeltaError::SpliceOutOfBounds {
                prefix: self.prefix_len,
                suffix: self.suffix_len,
                prior_len: prior.len(),
            });
        }

        let mut out = Vec::with_capacity(prefix_len + self.replacement.len() + suffix_len);
        out.extend_from_slice(&prior[..prefix_len]);
        out.extend_from_slice(&self.replacement);
        out.extend_from_slice(&prior[prior.len() - suffix_len..]);
        Ok(out)
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SPLICE_HEADER_SIZE + self.replacement.len());
        buf.extend_from_slice(&self.prefix_len.to_le_bytes());
        buf.extend_from_slice(&self.suffix_len.to_le_bytes());
        buf.extend_from_slice(&self.replacement);
        buf
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, DeltaError> {
        if data.len() < SPLICE_HEADER_SIZE {
            return Err(DeltaError::Truncated {
                expected: SPLICE_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let prefix_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let suffix_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Ok(Self {
            prefix_len,
            suffix_len,
            replacement: data[SPLICE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Delta codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// Delta body shorter than its header.
    #[error("delta truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Splice lengths exceed the prior payload.
    #[error("splice out of bounds: prefix {prefix} + suffix {suffix} > prior length {prior_len}")]
    SpliceOutOfBounds {
        /// Declared prefix length.
        prefix: u32,
        /// Declared suffix length.
        suffix: u32,
        /// Length of the prior payload.
        prior_len: usize,
    },
}
