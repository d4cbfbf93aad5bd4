//! Route entry types published through the coordination directory.

use serde::{Deserialize, Serialize};

use crate::core::{ContentHash, EndpointKey, NodeId};

/// Identifies which node owns an endpoint's live session for an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteTableAddress {
    /// Endpoint identity.
    pub endpoint: EndpointKey,
    /// Application the session belongs to.
    pub application_token: String,
    /// Node holding the live session.
    pub owner: NodeId,
}

impl RouteTableAddress {
    /// Create a route address.
    pub fn new(endpoint: EndpointKey, application_token: impl Into<String>, owner: NodeId) -> Self {
        Self {
            endpoint,
            application_token: application_token.into(),
            owner,
        }
    }
}

/// Whether a route entry announces or retracts ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOperation {
    /// Announce ownership of an endpoint session.
    Add,
    /// Retract ownership (session closing).
    Delete,
}

/// A cluster-wide route announcement.
///
/// `generation` is a monotonic per-session counter, never a wall-clock
/// timestamp: wall clocks are not safe for conflict resolution under clock
/// skew across nodes. Within one `(endpoint, node)` key the higher generation
/// wins regardless of delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRouteInfo {
    /// Tenant owning the endpoint.
    pub tenant_id: String,
    /// User the endpoint is attached to.
    pub user_id: String,
    /// Route address being announced or retracted.
    pub address: RouteTableAddress,
    /// Configuration schema version at announcement time.
    pub cf_version: u32,
    /// User-configuration hash at announcement time.
    pub ucf_hash: Option<ContentHash>,
    /// Add or delete.
    pub operation: RouteOperation,
    /// Monotonic per-session counter ordering add/delete for this key.
    pub generation: u64,
}

impl GlobalRouteInfo {
    /// Announce ownership of an endpoint session.
    pub fn add(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        address: RouteTableAddress,
        cf_version: u32,
        ucf_hash: Option<ContentHash>,
        generation: u64,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            address,
            cf_version,
            ucf_hash,
            operation: RouteOperation::Add,
            generation,
        }
    }

    /// Retract ownership of an endpoint session.
    pub fn delete(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        address: RouteTableAddress,
        generation: u64,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            address,
            cf_version: 0,
            ucf_hash: None,
            operation: RouteOperation::Delete,
            generation,
        }
    }

    /// Key this entry converges under.
    pub fn key(&self) -> (EndpointKey, NodeId) {
        (self.address.endpoint.clone(), self.address.owner.clone())
    }
}

/// Collaborator that carries route announcements off the session path.
///
/// Implemented by the announcer (directory publication with degraded-mode
/// queueing) and by the local replica (immediate apply).
pub trait RoutePublisher: Send + Sync + 'static {
    /// Publish one route announcement.
    fn publish(&self, route: GlobalRouteInfo);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> RouteTableAddress {
        RouteTableAddress::new(
            EndpointKey::from_public_key(b"ep"),
            "app-1",
            NodeId::new("node-a:9090"),
        )
    }

    #[test]
    fn test_add_and_delete_constructors() {
        let add = GlobalRouteInfo::add("t1", "u1", address(), 3, None, 1);
        assert_eq!(add.operation, RouteOperation::Add);
        assert_eq!(add.cf_version, 3);

        let delete = GlobalRouteInfo::delete("t1", "u1", address(), 2);
        assert_eq!(delete.operation, RouteOperation::Delete);
        assert_eq!(delete.cf_version, 0);
        assert!(delete.ucf_hash.is_none());
    }

    #[test]
    fn test_route_json_roundtrip() {
        let add = GlobalRouteInfo::add(
            "t1",
            "u1",
            address(),
            3,
            Some(ContentHash::of(b"ucf")),
            7,
        );
        let json = serde_json::to_string(&add).unwrap();
        let back: GlobalRouteInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, add);
    }
}
