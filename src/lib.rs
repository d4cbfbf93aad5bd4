//! # Fleet-Ops
//!
//! Operations tier for an IoT device-management cluster. Each operations
//! node terminates endpoint channels, answers versioned sync requests with
//! per-subsystem NO_DELTA / DELTA / RESYNC decisions, and keeps a replica of
//! the cluster-wide endpoint routing table so events reach whichever node
//! owns an endpoint's live session.
//!
//! ## Modules
//!
//! - [`core`]: identity types, collaborator contracts, constants, errors
//! - [`protocol`]: sync envelope model and wire codec
//! - [`delta`]: NO_DELTA / DELTA / RESYNC decision engine and splice codec
//! - [`session`]: per-endpoint session actors and the session manager
//! - [`routing`]: route-table replica and cross-node event relay
//! - [`cluster`]: directory abstraction, membership, announcer, ranking
//! - [`transport`]: pluggable channel contract and static registry
//! - [`node`]: process-level assembly of all of the above
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleet_ops::prelude::*;
//!
//! // Minimal state source: every subsystem serves one static payload.
//! struct StaticReader;
//!
//! impl StateReader for StaticReader {
//!     fn current_state(
//!         &self,
//!         _endpoint: &EndpointKey,
//!         _subsystem: Subsystem,
//!     ) -> Result<SubsystemSnapshot, StateReadError> {
//!         Ok(SubsystemSnapshot::new(1, b"schema".to_vec(), b"state".to_vec()))
//!     }
//! }
//!
//! struct StaticBinder;
//!
//! impl RouteBinder for StaticBinder {
//!     fn bind(&self, _endpoint: &EndpointKey, _application_token: &str) -> RouteBinding {
//!         RouteBinding {
//!             tenant_id: "tenant".to_string(),
//!             user_id: "user".to_string(),
//!         }
//!     }
//! }
//!
//! struct NoLink;
//!
//! impl NodeLink for NoLink {
//!     fn forward(&self, _node: &NodeId, _event: &EndpointEvent) -> Result<(), CoordinationError> {
//!         Err(CoordinationError::Unavailable("no peer link".to_string()))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), FleetError> {
//! let node = OperationsNode::start(
//!     NodeConfig {
//!         identity: NodeIdentity {
//!             node_id: NodeId::new("ops-1"),
//!             host: "10.0.0.1".to_string(),
//!             port: 9090,
//!             public_key: vec![0xAA; 32],
//!         },
//!         channels: vec![ChannelType::SyncRequestResponse, ChannelType::SyncLongPoll],
//!     },
//!     Arc::new(LocalDirectory::new()),
//!     Arc::new(StaticReader),
//!     Arc::new(StaticBinder),
//!     Arc::new(NoLink),
//! )?;
//!
//! // Transports feed raw envelopes in and send the returned bytes back.
//! let response = node.process_sync(&[]).await;
//! assert!(response.is_err()); // empty envelope is malformed
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod core;
pub mod delta;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{
        ChannelStats, ChannelSupport, ClusterNodeInfo, Directory, DirectoryEvent, DirectoryScope,
        HealthCounters, LocalDirectory, MembershipService, NodeDescriptor, RouteAnnouncer, rank,
    };
    pub use crate::core::*;
    pub use crate::delta::{ServedState, SpliceDelta, evaluate};
    pub use crate::node::{NodeConfig, NodeIdentity, OperationsNode};
    pub use crate::protocol::{
        ClientSubsystemState, ResponseStatus, SubsystemStatus, SyncRequest, SyncResponse,
    };
    pub use crate::routing::{
        EndpointEvent, EventRelay, GlobalRouteInfo, LocalSink, NodeLink, RouteOperation,
        RoutePublisher, RouteTable, RouteTableAddress,
    };
    pub use crate::session::{
        RouteBinder, RouteBinding, SessionHandle, SessionManager, SessionState,
    };
    pub use crate::transport::{
        ChannelHandler, ConnectionInfo, Transport, TransportConfig, TransportRegistry,
    };
}

// Re-export the types nearly every embedder touches.
pub use crate::core::{ChannelType, EndpointKey, FleetError, NodeId, Subsystem};
pub use crate::node::{NodeConfig, NodeIdentity, OperationsNode};
