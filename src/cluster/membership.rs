//! Cluster membership service.
//!
//! Watches the directory's node namespace and maintains a local view of all
//! live nodes. Listeners are invoked in FIFO order, one at a time, from a
//! single dispatch task; an unbounded internal queue absorbs bursts so no
//! update is ever dropped. The service also republishes the local node's
//! per-channel health counters.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::constants::HEALTH_REPUBLISH_INTERVAL;
use crate::core::{ChannelType, CoordinationError, NodeId};

use super::directory::{
    ClusterNodeInfo, Directory, DirectoryEvent, DirectoryScope, Registration, WatchHandle,
};
use super::health::HealthCounters;

/// Callback invoked for every membership or route change, in order.
pub type ClusterListener = Box<dyn Fn(&DirectoryEvent) + Send + Sync>;

/// Tracks live cluster nodes and dispatches directory changes.
pub struct MembershipService {
    directory: Arc<dyn Directory>,
    local: ClusterNodeInfo,
    nodes: Arc<DashMap<NodeId, ClusterNodeInfo>>,
    listeners: Arc<Mutex<Vec<ClusterListener>>>,
    registration: Mutex<Option<Registration>>,
    watches: Mutex<Vec<WatchHandle>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    /// Create a service for the local node; call [`start`](Self::start) to
    /// register and begin watching.
    pub fn new(directory: Arc<dyn Directory>, local: ClusterNodeInfo) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            directory,
            local,
            nodes: Arc::new(DashMap::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            registration: Mutex::new(None),
            watches: Mutex::new(Vec::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener for directory changes.
    ///
    /// Listeners registered before [`start`](Self::start) see every update.
    pub fn add_listener(&self, listener: impl Fn(&DirectoryEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Register the local node and start the dispatch task.
    ///
    /// Node and route events funnel into one unbounded queue consumed by a
    /// single task, preserving publication order across listeners.
    pub fn start(&self) -> Result<(), CoordinationError> {
        let registration = self.directory.register(self.local.clone())?;
        *self.registration.lock() = Some(registration);

        let (tx, rx) = mpsc::unbounded_channel();
        let node_watch = self.directory.watch(DirectoryScope::Nodes, tx.clone())?;
        let route_watch = self.directory.watch(DirectoryScope::Routes, tx)?;
        {
            let mut watches = self.watches.lock();
            watches.push(node_watch);
            watches.push(route_watch);
        }

        let task = tokio::spawn(Self::dispatch_loop(
            Arc::clone(&self.nodes),
            Arc::clone(&self.listeners),
            rx,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn dispatch_loop(
        nodes: Arc<DashMap<NodeId, ClusterNodeInfo>>,
        listeners: Arc<Mutex<Vec<ClusterListener>>>,
        mut rx: mpsc::UnboundedReceiver<DirectoryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match &event {
                        DirectoryEvent::NodeAdded(info) | DirectoryEvent::NodeUpdated(info) => {
                            nodes.insert(info.node_id.clone(), info.clone());
                        }
                        DirectoryEvent::NodeRemoved(node_id) => {
                            debug!(node = %node_id, "node left the cluster");
                            nodes.remove(node_id);
                        }
                        DirectoryEvent::RoutePublished(_) => {}
                    }
                    // One at a time, registration order.
                    for listener in listeners.lock().iter() {
                        listener(&event);
                    }
                }
            }
        }
    }

    /// Start the periodic health-counter republish loop.
    pub fn start_health_loop(&self, counters: Arc<HealthCounters>) {
        let directory = Arc::clone(&self.directory);
        let mut local = self.local.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_REPUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for support in &mut local.channels {
                            support.stats = counters.stats(support.channel);
                        }
                        if let Err(err) = directory.update(local.clone()) {
                            warn!(%err, "health republish failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Point-in-time snapshot of all known nodes.
    pub fn snapshot(&self) -> Vec<ClusterNodeInfo> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Known nodes supporting a channel type.
    pub fn nodes_supporting(&self, channel: ChannelType) -> Vec<ClusterNodeInfo> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().supports(channel))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The local node's registration info.
    pub fn local_node(&self) -> &ClusterNodeInfo {
        &self.local
    }

    /// Release the registration, cancel watches, and stop background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(registration) = self.registration.lock().take() {
            registration.release();
        }
        for watch in self.watches.lock().drain(..) {
            watch.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::directory::{ChannelSupport, LocalDirectory};
    use crate::cluster::health::ChannelStats;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn node(id: &str) -> ClusterNodeInfo {
        ClusterNodeInfo {
            node_id: NodeId::new(id),
            host: "10.0.0.1".to_string(),
            port: 9090,
            public_key: vec![0xAA],
            channels: vec![ChannelSupport {
                channel: ChannelType::SyncLongPoll,
                stats: ChannelStats::default(),
            }],
        }
    }

    async fn settle() {
        // Let the dispatch task drain its queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_snapshot_tracks_membership() {
        let directory = Arc::new(LocalDirectory::new());
        let service = MembershipService::new(directory.clone(), node("node-a"));
        service.start().unwrap();

        let peer = directory.register(node("node-b")).unwrap();
        settle().await;
        let ids: Vec<NodeId> = service.snapshot().into_iter().map(|n| n.node_id).collect();
        assert!(ids.contains(&NodeId::new("node-a")));
        assert!(ids.contains(&NodeId::new("node-b")));

        peer.release();
        settle().await;
        let ids: Vec<NodeId> = service.snapshot().into_iter().map(|n| n.node_id).collect();
        assert!(!ids.contains(&NodeId::new("node-b")));

        service.shutdown();
    }

    #[tokio::test]
    async fn test_listeners_fire_in_fifo_order_without_drops() {
        let directory = Arc::new(LocalDirectory::new());
        let service = MembershipService::new(directory.clone(), node("node-a"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        service.add_listener(move |event| {
            if let DirectoryEvent::NodeAdded(info) = event {
                seen_clone.lock().push(info.node_id.clone());
            }
        });
        service.start().unwrap();

        // Burst of registrations; the unbounded queue must absorb all.
        let mut registrations = Vec::new();
        for i in 0..20 {
            registrations.push(directory.register(node(&format!("peer-{i:02}"))).unwrap());
        }
        settle().await;

        let observed = seen.lock().clone();
        let peers: Vec<NodeId> = observed
            .iter()
            .filter(|id| id.as_str().starts_with("peer-"))
            .cloned()
            .collect();
        let expected: Vec<NodeId> = (0..20).map(|i| NodeId::new(format!("peer-{i:02}"))).collect();
        assert_eq!(peers, expected);

        service.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_releases_registration() {
        let directory = Arc::new(LocalDirectory::new());
        let service = MembershipService::new(directory.clone(), node("node-a"));
        service.start().unwrap();
        assert_eq!(directory.nodes().len(), 1);

        service.shutdown();
        assert!(directory.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_route_events_reach_listeners() {
        use crate::core::EndpointKey;
        use crate::routing::{GlobalRouteInfo, RouteTableAddress};

        let directory = Arc::new(LocalDirectory::new());
        let service = MembershipService::new(directory.clone(), node("node-a"));
        let routes_seen = Arc::new(AtomicUsize::new(0));
        let routes_clone = Arc::clone(&routes_seen);
        service.add_listener(move |event| {
            if matches!(event, DirectoryEvent::RoutePublished(_)) {
                routes_clone.fetch_add(1, Ordering::Relaxed);
            }
        });
        service.start().unwrap();

        let route = GlobalRouteInfo::add(
            "tenant",
            "user",
            RouteTableAddress::new(
                EndpointKey::from_public_key(b"ep"),
                "app",
                NodeId::new("node-a"),
            ),
            1,
            None,
            1,
        );
        directory.publish_route(&route).unwrap();
        settle().await;

        assert_eq!(routes_seen.load(Ordering::Relaxed), 1);
        service.shutdown();
    }
}
