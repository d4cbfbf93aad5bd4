//! Sync envelope types and wire codec.
//!
//! A sync envelope carries one status block per subsystem. Encoding is
//! deterministic: identical values always encode to identical bytes, which is
//! what makes cached-response replay safe for client retransmission.
//!
//! Request wire format:
//! ```text
//! +0   Protocol Version (2 bytes LE16)
//! +2   Channel Type (1 byte)
//! +3   Block Count (1 byte)
//! +4   Request Id (8 bytes LE64)
//! +12  Endpoint Key (32 bytes)
//! +44  Max Wait ms (4 bytes LE32, 0 = no long poll)
//! +48  App Token Length (2 bytes LE16) + App Token (UTF-8)
//! then per block:
//!      Subsystem (1) | Flags (1) | Seq (8 bytes LE64) | [Hash (32)]
//! ```
//!
//! Response wire format:
//! ```text
//! +0   Protocol Version (2 bytes LE16)
//! +2   Block Count (1 byte)
//! +3   Request Id (8 bytes LE64)
//! then per block:
//!      Subsystem (1) | Status (1) | Seq (8 bytes LE64)
//!      [Schema Length (4 bytes LE32) + Schema]
//!      [Delta Length (4 bytes LE32) + Delta]
//! ```

use thiserror::Error;

use crate::core::constants::PROTOCOL_VERSION;
use crate::core::{ChannelType, ContentHash, EndpointKey, Subsystem};

/// Fixed part of the request header.
pub const REQUEST_HEADER_SIZE: usize = 48;

/// Fixed part of the response header.
pub const RESPONSE_HEADER_SIZE: usize = 11;

// Request block flags.
const FLAG_RESYNC_ONLY: u8 = 0x01;
const FLAG_HAS_HASH: u8 = 0x02;

// Response block flags (folded into the status byte's high bits).
const FLAG_HAS_SCHEMA: u8 = 0x40;
const FLAG_HAS_DELTA: u8 = 0x80;
const STATUS_MASK: u8 = 0x0F;

/// Per-subsystem delta decision carried in a response block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Client state matches server state; no payload.
    NoDelta,
    /// Payload transforms the client's declared state into the current state.
    Delta,
    /// Full schema + state body; no incremental path existed.
    Resync,
    /// This subsystem's state source failed; siblings are unaffected.
    Failed,
}

impl ResponseStatus {
    fn wire_id(self) -> u8 {
        match self {
            Self::NoDelta => 0x01,
            Self::Delta => 0x02,
            Self::Resync => 0x03,
            Self::Failed => 0x04,
        }
    }

    fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::NoDelta),
            0x02 => Some(Self::Delta),
            0x03 => Some(Self::Resync),
            0x04 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Client-declared state for one subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubsystemState {
    /// Subsystem this block refers to.
    pub subsystem: Subsystem,
    /// Last sequence number the client applied.
    pub seq: u64,
    /// Content hash of the client's current state, if it has one.
    pub hash: Option<ContentHash>,
    /// Client explicitly requests a full resync.
    pub resync_only: bool,
}

/// Server status block for one subsystem.
///
/// Invariant: `seq` never decreases across successive responses for a given
/// endpoint + subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemStatus {
    /// Subsystem this block refers to.
    pub subsystem: Subsystem,
    /// Sequence number of the served state.
    pub seq: u64,
    /// Delta decision.
    pub status: ResponseStatus,
    /// Schema body (present on RESYNC).
    pub schema_body: Option<Vec<u8>>,
    /// Delta or full-state body.
    pub delta_body: Option<Vec<u8>>,
}

impl SubsystemStatus {
    /// NO_DELTA block: no payload.
    pub fn no_delta(subsystem: Subsystem, seq: u64) -> Self {
        Self {
            subsystem,
            seq,
            status: ResponseStatus::NoDelta,
            schema_body: None,
            delta_body: None,
        }
    }

    /// DELTA block with an incremental payload.
    pub fn delta(subsystem: Subsystem, seq: u64, delta_body: Vec<u8>) -> Self {
        Self {
            subsystem,
            seq,
            status: ResponseStatus::Delta,
            schema_body: None,
            delta_body: Some(delta_body),
        }
    }

    /// RESYNC block with full schema + state body.
    pub fn resync(subsystem: Subsystem, seq: u64, schema_body: Vec<u8>, state_body: Vec<u8>) -> Self {
        Self {
            subsystem,
            seq,
            status: ResponseStatus::Resync,
            schema_body: Some(schema_body),
            delta_body: Some(state_body),
        }
    }

    /// Failure block for a subsystem whose state source failed.
    pub fn failed(subsystem: Subsystem, seq: u64) -> Self {
        Self {
            subsystem,
            seq,
            status: ResponseStatus::Failed,
            schema_body: None,
            delta_body: None,
        }
    }
}

/// A decoded sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Endpoint identity.
    pub endpoint: EndpointKey,
    /// Application the endpoint belongs to.
    pub application_token: String,
    /// Channel the request arrived on.
    pub channel: ChannelType,
    /// Monotonic per-channel request id; drives replay detection.
    pub request_id: u64,
    /// Requested long-poll wait in milliseconds (0 = answer immediately).
    pub max_wait_ms: u32,
    /// One declared-state block per subsystem of interest.
    pub blocks: Vec<ClientSubsystemState>,
}

impl SyncRequest {
    /// True if the client asked to be parked when nothing is new.
    pub fn is_long_poll(&self) -> bool {
        self.channel == ChannelType::SyncLongPoll && self.max_wait_ms > 0
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.blocks.len() > u8::MAX as usize {
            return Err(EnvelopeError::TooManyBlocks(self.blocks.len()));
        }
        if self.application_token.len() > u16::MAX as usize {
            return Err(EnvelopeError::TokenTooLong(self.application_token.len()));
        }

        let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + self.application_token.len());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.push(self.channel.wire_id());
        buf.push(self.blocks.len() as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(self.endpoint.as_bytes());
        buf.extend_from_slice(&self.max_wait_ms.to_le_bytes());
        buf.extend_from_slice(&(self.application_token.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.application_token.as_bytes());

        for block in &self.blocks {
            buf.push(block.subsystem.wire_id());
            let mut flags = 0u8;
            if block.resync_only {
                flags |= FLAG_RESYNC_ONLY;
            }
            if block.hash.is_some() {
                flags |= FLAG_HAS_HASH;
            }
            buf.push(flags);
            buf.extend_from_slice(&block.seq.to_le_bytes());
            if let Some(hash) = &block.hash {
                buf.extend_from_slice(hash.as_bytes());
            }
        }

        Ok(buf)
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut cursor = Cursor::new(data);

        let version = cursor.read_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let channel_id = cursor.read_u8()?;
        let channel = ChannelType::from_wire_id(channel_id)
            .ok_or(EnvelopeError::UnknownChannel(channel_id))?;
        let block_count = cursor.read_u8()? as usize;
        let request_id = cursor.read_u64()?;
        let endpoint = EndpointKey::from_bytes(cursor.read_array::<32>()?);
        let max_wait_ms = cursor.read_u32()?;
        let token_len = cursor.read_u16()? as usize;
        let token_bytes = cursor.read_bytes(token_len)?;
        let application_token = String::from_utf8(token_bytes.to_vec())
            .map_err(|_| EnvelopeError::InvalidToken)?;

        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let subsystem_id = cursor.read_u8()?;
            let subsystem = Subsystem::from_wire_id(subsystem_id)
                .ok_or(EnvelopeError::UnknownSubsystem(subsystem_id))?;
            let flags = cursor.read_u8()?;
            let seq = cursor.read_u64()?;
            let hash = if flags & FLAG_HAS_HASH != 0 {
                Some(ContentHash::from_bytes(cursor.read_array::<32>()?))
            } else {
                None
            };
            blocks.push(ClientSubsystemState {
                subsystem,
                seq,
                hash,
                resync_only: flags & FLAG_RESYNC_ONLY != 0,
            });
        }

        Ok(Self {
            endpoint,
            application_token,
            channel,
            request_id,
            max_wait_ms,
            blocks,
        })
    }
}

/// A sync response: one status block per requested subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    /// Echo of the request id this response answers.
    pub request_id: u64,
    /// Status blocks in request order.
    pub blocks: Vec<SubsystemStatus>,
}

impl SyncResponse {
    /// Encode to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.blocks.len() > u8::MAX as usize {
            return Err(EnvelopeError::TooManyBlocks(self.blocks.len()));
        }

        let mut buf = Vec::with_capacity(RESPONSE_HEADER_SIZE);
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.push(self.blocks.len() as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());

        for block in &self.blocks {
            buf.push(block.subsystem.wire_id());
            let mut status = block.status.wire_id();
            if block.schema_body.is_some() {
                status |= FLAG_HAS_SCHEMA;
            }
            if block.delta_body.is_some() {
                status |= FLAG_HAS_DELTA;
            }
            buf.push(status);
            buf.extend_from_slice(&block.seq.to_le_bytes());
            if let Some(schema) = &block.schema_body {
                buf.extend_from_slice(&(schema.len() as u32).to_le_bytes());
                buf.extend_from_slice(schema);
            }
            if let Some(delta) = &block.delta_body {
                buf.extend_from_slice(&(delta.len() as u32).to_le_bytes());
                buf.extend_from_slice(delta);
            }
        }

        Ok(buf)
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut cursor = Cursor::new(data);

        let version = cursor.read_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let block_count = cursor.read_u8()? as usize;
        let request_id = cursor.read_u64()?;

        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let subsystem_id = cursor.read_u8()?;
            let subsystem = Subsystem::from_wire_id(subsystem_id)
                .ok_or(EnvelopeError::UnknownSubsystem(subsystem_id))?;
            let raw_status = cursor.read_u8()?;
            let status = ResponseStatus::from_wire_id(raw_status & STATUS_MASK)
                .ok_or(EnvelopeError::UnknownStatus(raw_status & STATUS_MASK))?;
            let seq = cursor.read_u64()?;
            let schema_body = if raw_status & FLAG_HAS_SCHEMA != 0 {
                let len = cursor.read_u32()? as usize;
                Some(cursor.read_bytes(len)?.to_vec())
            } else {
                None
            };
            let delta_body = if raw_status & FLAG_HAS_DELTA != 0 {
                let len = cursor.read_u32()? as usize;
                Some(cursor.read_bytes(len)?.to_vec())
            } else {
                None
            };
            blocks.push(SubsystemStatus {
                subsystem,
                seq,
                status,
                schema_body,
                delta_body,
            });
        }

        Ok(Self { request_id, blocks })
    }
}

/// Envelope encoding/decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Input data is shorter than required.
    #[error("envelope too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0:#06x}")]
    UnsupportedVersion(u16),

    /// Unknown channel type id.
    #[error("unknown channel type: {0:#04x}")]
    UnknownChannel(u8),

    /// Unknown subsystem id.
    #[error("unknown subsystem: {0:#04x}")]
    UnknownSubsystem(u8),

    /// Unknown response status id.
    #[error("unknown response status: {0:#04x}")]
    UnknownStatus(u8),

    /// Application token is not valid UTF-8.
    #[error("application token is not valid UTF-8")]
    InvalidToken,

    /// More blocks than the envelope can carry.
    #[error("too many blocks: {0}")]
    TooManyBlocks(usize),

    /// Application token exceeds the wire limit.
    #[error("application token too long: {0} bytes")]
    TokenTooLong(usize),
}

/// Minimal bounds-checked reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.checked_add(len).ok_or(EnvelopeError::TooShort {
            expected: usize::MAX,
            actual: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(EnvelopeError::TooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, EnvelopeError> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32, EnvelopeError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64, EnvelopeError> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }
}
