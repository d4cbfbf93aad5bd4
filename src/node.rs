//! Operations node assembly.
//!
//! Wires the session layer, route table, cluster membership, announcer, and
//! event relay into one process-level object. Transports talk to the node
//! through [`ChannelHandler`]; everything else reaches it through the typed
//! methods.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::cluster::{
    ChannelStats, ChannelSupport, ClusterNodeInfo, Directory, DirectoryEvent, HealthCounters,
    MembershipService, NodeDescriptor, RouteAnnouncer, rank,
};
use crate::core::{ChannelType, EndpointKey, FleetError, NodeId, ProtocolError, StateReader, Subsystem, TransportFault};
use crate::protocol::SyncRequest;
use crate::routing::{EndpointEvent, EventRelay, GlobalRouteInfo, LocalSink, NodeLink, RoutePublisher, RouteTable};
use crate::session::{RouteBinder, SessionManager};
use crate::transport::ChannelHandler;

/// Identity a node presents to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Cluster-unique node id.
    pub node_id: NodeId,
    /// Host endpoints and peers reach this node on.
    pub host: String,
    /// Port endpoints and peers reach this node on.
    pub port: u16,
    /// Node public key, handed to endpoints at bootstrap.
    pub public_key: Vec<u8>,
}

impl NodeIdentity {
    /// Reject corrupt or missing identity material.
    ///
    /// A node with a broken identity must not join the cluster: peers would
    /// route to an address that cannot be trusted or reached.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.node_id.as_str().is_empty() {
            return Err(FleetError::Fatal("node identity has empty node id".to_string()));
        }
        if self.host.is_empty() || self.port == 0 {
            return Err(FleetError::Fatal(format!(
                "node identity has invalid address {}:{}",
                self.host, self.port
            )));
        }
        if self.public_key.is_empty() {
            return Err(FleetError::Fatal("node identity has no public key".to_string()));
        }
        Ok(())
    }
}

/// Startup parameters for an operations node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local identity; validated before anything else happens.
    pub identity: NodeIdentity,
    /// Channel types this node serves.
    pub channels: Vec<ChannelType>,
}

/// Applies a route locally, then announces it to the cluster.
///
/// Local apply first: this node's own replica must never lag its own
/// announcements.
struct FanoutPublisher {
    table: Arc<RouteTable>,
    announcer: Arc<RouteAnnouncer>,
}

impl RoutePublisher for FanoutPublisher {
    fn publish(&self, route: GlobalRouteInfo) {
        self.table.apply(route.clone());
        self.announcer.publish(route);
    }
}

/// Delivers relayed events into the local session layer.
struct ManagerSink {
    manager: Arc<SessionManager>,
}

impl LocalSink for ManagerSink {
    fn deliver_local(&self, event: &EndpointEvent) {
        self.manager.notify_change(&event.endpoint, Subsystem::Event);
    }
}

/// A running operations node.
pub struct OperationsNode {
    identity: NodeIdentity,
    manager: Arc<SessionManager>,
    table: Arc<RouteTable>,
    membership: Arc<MembershipService>,
    announcer: Arc<RouteAnnouncer>,
    relay: Arc<EventRelay>,
    counters: Arc<HealthCounters>,
    shutdown_tx: watch::Sender<bool>,
}

impl OperationsNode {
    /// Validate identity, register with the cluster, and start background
    /// loops. Must run inside a tokio runtime.
    pub fn start(
        config: NodeConfig,
        directory: Arc<dyn Directory>,
        reader: Arc<dyn StateReader>,
        binder: Arc<dyn RouteBinder>,
        link: Arc<dyn NodeLink>,
    ) -> Result<Arc<Self>, FleetError> {
        config.identity.validate()?;
        let identity = config.identity;
        info!(node = %identity.node_id, host = %identity.host, port = identity.port, "starting operations node");

        let counters = Arc::new(HealthCounters::new());
        let table = Arc::new(RouteTable::new());
        let announcer = Arc::new(RouteAnnouncer::new(Arc::clone(&directory)));
        let publisher = Arc::new(FanoutPublisher {
            table: Arc::clone(&table),
            announcer: Arc::clone(&announcer),
        });

        let manager = Arc::new(SessionManager::new(
            identity.node_id.clone(),
            reader,
            binder,
            publisher,
            Arc::clone(&counters),
        ));
        {
            let manager = Arc::clone(&manager);
            announcer.set_active_routes(Box::new(move || manager.active_routes()));
        }

        let local_info = ClusterNodeInfo {
            node_id: identity.node_id.clone(),
            host: identity.host.clone(),
            port: identity.port,
            public_key: identity.public_key.clone(),
            channels: config
                .channels
                .iter()
                .map(|&channel| ChannelSupport {
                    channel,
                    stats: ChannelStats::default(),
                })
                .collect(),
        };
        let membership = Arc::new(MembershipService::new(directory, local_info));
        {
            // Peer route announcements converge into the local replica.
            let table = Arc::clone(&table);
            membership.add_listener(move |event| {
                if let DirectoryEvent::RoutePublished(route) = event {
                    table.apply(route.clone());
                }
            });
        }
        membership.start()?;
        membership.start_health_loop(Arc::clone(&counters));

        let relay = Arc::new(EventRelay::new(
            identity.node_id.clone(),
            Arc::clone(&table),
            link,
            Arc::new(ManagerSink {
                manager: Arc::clone(&manager),
            }),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        tokio::spawn(Arc::clone(&relay).run_retry_loop(shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&announcer).run_retry_loop(shutdown_tx.subscribe()));

        Ok(Arc::new(Self {
            identity,
            manager,
            table,
            membership,
            announcer,
            relay,
            counters,
            shutdown_tx,
        }))
    }

    /// Decode and process one sync envelope, returning the encoded response.
    pub async fn process_sync(&self, bytes: &[u8]) -> Result<Vec<u8>, FleetError> {
        let request = SyncRequest::decode(bytes)
            .map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        self.manager.process_sync(request).await
    }

    /// Deliver an endpoint event, locally or by forwarding to its owner.
    pub fn deliver_event(&self, event: EndpointEvent) {
        self.relay.deliver(event);
    }

    /// Notify a locally owned session that server-side state changed.
    pub fn notify_change(&self, endpoint: &EndpointKey, subsystem: Subsystem) {
        self.manager.notify_change(endpoint, subsystem);
    }

    /// Terminate the session for an endpoint whose channel closed.
    pub fn close_channel(&self, endpoint: &EndpointKey) {
        self.manager.close_channel(endpoint);
    }

    /// Rank cluster nodes for an endpoint bootstrapping onto `channel`.
    pub fn rank_nodes(&self, channel: ChannelType) -> Vec<NodeDescriptor> {
        rank(channel, &self.membership.snapshot())
    }

    /// This node's identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Local route-table replica.
    pub fn route_table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Live per-channel health counters.
    pub fn health(&self) -> &Arc<HealthCounters> {
        &self.counters
    }

    /// True while route announcements are queued against a lost directory.
    pub fn is_degraded(&self) -> bool {
        self.announcer.is_degraded()
    }

    /// Handler for transports to drive.
    pub fn channel_handler(self: &Arc<Self>) -> Arc<dyn ChannelHandler> {
        Arc::new(NodeChannelHandler {
            node: Arc::clone(self),
        })
    }

    /// Leave the cluster and stop background loops.
    ///
    /// The ephemeral registration is released first so peers stop routing
    /// here before the session layer winds down.
    pub fn shutdown(&self) {
        info!(node = %self.identity.node_id, "shutting down operations node");
        self.membership.shutdown();
        let _ = self.shutdown_tx.send(true);
    }
}

struct NodeChannelHandler {
    node: Arc<OperationsNode>,
}

impl ChannelHandler for NodeChannelHandler {
    fn on_sync_request(&self, bytes: Vec<u8>, respond: oneshot::Sender<Vec<u8>>) {
        let node = Arc::clone(&self.node);
        tokio::spawn(async move {
            match node.process_sync(&bytes).await {
                Ok(response) => {
                    let _ = respond.send(response);
                }
                Err(err) => {
                    // Dropping the sender signals the transport to close
                    // the channel.
                    error!(%err, "sync processing failed");
                }
            }
        });
    }

    fn on_close(&self, endpoint: &EndpointKey) {
        self.node.close_channel(endpoint);
    }

    fn on_error(&self, endpoint: &EndpointKey, fault: TransportFault) {
        warn!(endpoint = %endpoint, %fault, "channel fault, closing session");
        self.node.close_channel(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalDirectory;
    use crate::core::{ContentHash, CoordinationError, StateReadError, SubsystemSnapshot};
    use crate::protocol::{ClientSubsystemState, ResponseStatus, SyncResponse};
    use crate::session::RouteBinding;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    struct MapReader {
        states: Mutex<HashMap<Subsystem, SubsystemSnapshot>>,
    }

    impl MapReader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(HashMap::new()),
            })
        }

        fn set(&self, subsystem: Subsystem, seq: u64, payload: &[u8]) {
            self.states.lock().insert(
                subsystem,
                SubsystemSnapshot::new(seq, b"schema".to_vec(), payload.to_vec()),
            );
        }
    }

    impl StateReader for MapReader {
        fn current_state(
            &self,
            _endpoint: &EndpointKey,
            subsystem: Subsystem,
        ) -> Result<SubsystemSnapshot, StateReadError> {
            self.states
                .lock()
                .get(&subsystem)
                .cloned()
                .ok_or_else(|| StateReadError::Unavailable("no state".to_string()))
        }
    }

    struct FixedBinder;

    impl RouteBinder for FixedBinder {
        fn bind(&self, _endpoint: &EndpointKey, _application_token: &str) -> RouteBinding {
            RouteBinding {
                tenant_id: "tenant-1".to_string(),
                user_id: "user-1".to_string(),
            }
        }
    }

    #[derive(Default)]
    struct RecordingLink {
        forwarded: Mutex<Vec<(NodeId, EndpointEvent)>>,
    }

    impl NodeLink for RecordingLink {
        fn forward(&self, node: &NodeId, event: &EndpointEvent) -> Result<(), CoordinationError> {
            self.forwarded.lock().push((node.clone(), event.clone()));
            Ok(())
        }
    }

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: NodeId::new(id),
            host: "10.0.0.1".to_string(),
            port: 9090,
            public_key: vec![0xAA; 32],
        }
    }

    fn start_node(
        id: &str,
        directory: Arc<LocalDirectory>,
        reader: Arc<MapReader>,
    ) -> (Arc<OperationsNode>, Arc<RecordingLink>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
        let link = Arc::new(RecordingLink::default());
        let node = OperationsNode::start(
            NodeConfig {
                identity: identity(id),
                channels: vec![ChannelType::SyncRequestResponse, ChannelType::SyncLongPoll],
            },
            directory,
            reader,
            Arc::new(FixedBinder),
            link.clone(),
        )
        .unwrap();
        (node, link)
    }

    fn sync_bytes(tag: &[u8], id: u64, seq: u64, hash: Option<ContentHash>) -> Vec<u8> {
        SyncRequest {
            endpoint: EndpointKey::from_public_key(tag),
            application_token: "app".to_string(),
            channel: ChannelType::SyncRequestResponse,
            request_id: id,
            max_wait_ms: 0,
            blocks: vec![ClientSubsystemState {
                subsystem: Subsystem::Configuration,
                seq,
                hash,
                resync_only: false,
            }],
        }
        .encode()
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_invalid_identity_refuses_to_join() {
        let directory = Arc::new(LocalDirectory::new());
        let mut bad = identity("node-a");
        bad.public_key.clear();

        let result = OperationsNode::start(
            NodeConfig {
                identity: bad,
                channels: vec![ChannelType::SyncRequestResponse],
            },
            directory.clone(),
            MapReader::new(),
            Arc::new(FixedBinder),
            Arc::new(RecordingLink::default()),
        );
        assert!(matches!(result, Err(FleetError::Fatal(_))));
        assert!(directory.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_sync_round_trip_through_node() {
        let directory = Arc::new(LocalDirectory::new());
        let reader = MapReader::new();
        reader.set(Subsystem::Configuration, 3, b"config-v3");
        let (node, _) = start_node("node-a", directory, reader);

        let bytes = node
            .process_sync(&sync_bytes(b"e1", 1, 0, None))
            .await
            .unwrap();
        let response = SyncResponse::decode(&bytes).unwrap();
        assert_eq!(response.blocks[0].status, ResponseStatus::Resync);

        // The new session's route landed in the local replica.
        settle().await;
        assert_eq!(
            node.route_table().lookup(&EndpointKey::from_public_key(b"e1")),
            Some(NodeId::new("node-a"))
        );
        node.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_a_protocol_error() {
        let directory = Arc::new(LocalDirectory::new());
        let (node, _) = start_node("node-a", directory, MapReader::new());
        let result = node.process_sync(&[0xFF, 0xFF, 0x00]).await;
        assert!(matches!(result, Err(FleetError::Protocol(_))));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_routes_propagate_between_nodes() {
        let directory = Arc::new(LocalDirectory::new());
        let reader = MapReader::new();
        reader.set(Subsystem::Configuration, 1, b"config");
        let (node_a, _) = start_node("node-a", directory.clone(), reader.clone());
        let (node_b, _) = start_node("node-b", directory, reader);

        node_a
            .process_sync(&sync_bytes(b"e1", 1, 0, None))
            .await
            .unwrap();
        settle().await;

        // Peer replica learned the owner through the directory.
        assert_eq!(
            node_b.route_table().lookup(&EndpointKey::from_public_key(b"e1")),
            Some(NodeId::new("node-a"))
        );

        node_a.shutdown();
        node_b.shutdown();
    }

    #[tokio::test]
    async fn test_event_for_remote_endpoint_is_forwarded() {
        let directory = Arc::new(LocalDirectory::new());
        let reader = MapReader::new();
        reader.set(Subsystem::Configuration, 1, b"config");
        let (node_a, _) = start_node("node-a", directory.clone(), reader.clone());
        let (node_b, link_b) = start_node("node-b", directory, reader);

        node_a
            .process_sync(&sync_bytes(b"e1", 1, 0, None))
            .await
            .unwrap();
        settle().await;

        node_b.deliver_event(EndpointEvent {
            endpoint: EndpointKey::from_public_key(b"e1"),
            payload: b"ping".to_vec(),
        });

        let forwarded = link_b.forwarded.lock();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, NodeId::new("node-a"));

        node_a.shutdown();
        node_b.shutdown();
    }

    #[tokio::test]
    async fn test_node_ranking_prefers_channel_support() {
        let directory = Arc::new(LocalDirectory::new());
        let reader = MapReader::new();
        let (node_a, _) = start_node("node-a", directory.clone(), reader.clone());

        // A peer that only serves async events.
        let peer = ClusterNodeInfo {
            node_id: NodeId::new("node-events"),
            host: "10.0.0.2".to_string(),
            port: 9090,
            public_key: vec![0xBB; 32],
            channels: vec![ChannelSupport {
                channel: ChannelType::AsyncEvent,
                stats: ChannelStats::default(),
            }],
        };
        let registration = directory.register(peer).unwrap();
        settle().await;

        let ranked = node_a.rank_nodes(ChannelType::SyncLongPoll);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].host, "10.0.0.1");

        registration.release();
        node_a.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_the_cluster() {
        let directory = Arc::new(LocalDirectory::new());
        let (node, _) = start_node("node-a", directory.clone(), MapReader::new());
        assert_eq!(directory.nodes().len(), 1);

        node.shutdown();
        assert!(directory.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_directory_outage_enters_degraded_mode() {
        let directory = Arc::new(LocalDirectory::new());
        let reader = MapReader::new();
        reader.set(Subsystem::Configuration, 1, b"config");
        let (node, _) = start_node("node-a", directory.clone(), reader);

        directory.set_reachable(false);
        node.process_sync(&sync_bytes(b"e1", 1, 0, None))
            .await
            .unwrap();
        assert!(node.is_degraded());

        // Sessions keep working against the local replica.
        assert_eq!(
            node.route_table().lookup(&EndpointKey::from_public_key(b"e1")),
            Some(NodeId::new("node-a"))
        );

        directory.set_reachable(true);
        node.shutdown();
    }
}
