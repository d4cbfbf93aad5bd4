//! Core identity and channel types shared across the crate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of an endpoint key (SHA-256 of the endpoint public key).
pub const ENDPOINT_KEY_SIZE: usize = 32;

/// Size of a subsystem content hash.
pub const CONTENT_HASH_SIZE: usize = 32;

/// Endpoint identity derived from the endpoint's public key hash.
///
/// Immutable and globally unique; two endpoints with the same public key are
/// the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey([u8; ENDPOINT_KEY_SIZE]);

impl EndpointKey {
    /// Create an endpoint key from raw hash bytes.
    pub fn from_bytes(bytes: [u8; ENDPOINT_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the endpoint key from an endpoint public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(digest.into())
    }

    /// Get the key as bytes.
    pub fn as_bytes(&self) -> &[u8; ENDPOINT_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to correlate log lines.
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// SHA-256 hash of a subsystem payload.
///
/// Used by the delta engine to compare the client's declared state against
/// the server's current state without shipping the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; CONTENT_HASH_SIZE]);

impl ContentHash {
    /// Create a content hash from raw bytes.
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hash a payload.
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    /// Get the hash as bytes.
    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Channel kinds an operations node can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Plain request/response sync (one request, one immediate response).
    SyncRequestResponse,
    /// Long-poll sync (response withheld until data or deadline).
    SyncLongPoll,
    /// Server-initiated event push over a persistent connection.
    AsyncEvent,
}

impl ChannelType {
    /// Wire id for the channel type.
    pub fn wire_id(self) -> u8 {
        match self {
            Self::SyncRequestResponse => 0x01,
            Self::SyncLongPoll => 0x02,
            Self::AsyncEvent => 0x03,
        }
    }

    /// Parse a wire id.
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::SyncRequestResponse),
            0x02 => Some(Self::SyncLongPoll),
            0x03 => Some(Self::AsyncEvent),
            _ => None,
        }
    }
}

/// Server-side subsystems an endpoint synchronizes against.
///
/// Each subsystem carries its own sequence number and content hash; the
/// envelope holds one status block per subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Application configuration pushed to the endpoint.
    Configuration,
    /// Notification topics and messages.
    Notification,
    /// Endpoint-to-endpoint event state.
    Event,
    /// Endpoint profile registered with the server.
    Profile,
}

impl Subsystem {
    /// All subsystems, in wire order.
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Configuration,
        Subsystem::Notification,
        Subsystem::Event,
        Subsystem::Profile,
    ];

    /// Wire id for the subsystem.
    pub fn wire_id(self) -> u8 {
        match self {
            Self::Configuration => 0x01,
            Self::Notification => 0x02,
            Self::Event => 0x03,
            Self::Profile => 0x04,
        }
    }

    /// Parse a wire id.
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Configuration),
            0x02 => Some(Self::Notification),
            0x03 => Some(Self::Event),
            0x04 => Some(Self::Profile),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key_from_public_key() {
        let key1 = EndpointKey::from_public_key(b"endpoint-public-key-a");
        let key2 = EndpointKey::from_public_key(b"endpoint-public-key-a");
        let key3 = EndpointKey::from_public_key(b"endpoint-public-key-b");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_content_hash_of_payload() {
        let a = ContentHash::of(b"payload");
        let b = ContentHash::of(b"payload");
        let c = ContentHash::of(b"other payload");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_subsystem_wire_roundtrip() {
        for subsystem in Subsystem::ALL {
            assert_eq!(Subsystem::from_wire_id(subsystem.wire_id()), Some(subsystem));
        }
        assert_eq!(Subsystem::from_wire_id(0xFF), None);
    }

    #[test]
    fn test_channel_type_wire_roundtrip() {
        for channel in [
            ChannelType::SyncRequestResponse,
            ChannelType::SyncLongPoll,
            ChannelType::AsyncEvent,
        ] {
            assert_eq!(ChannelType::from_wire_id(channel.wire_id()), Some(channel));
        }
        assert_eq!(ChannelType::from_wire_id(0x00), None);
    }

    #[test]
    fn test_endpoint_key_display_is_short_prefix() {
        let key = EndpointKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{key}"), "abababababababab");
    }
}
