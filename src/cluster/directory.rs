//! Coordination directory contract and an in-process implementation.
//!
//! Any service offering consistent, ephemeral-membership semantics qualifies
//! as a [`Directory`]: node registrations are tied to the registration handle
//! and vanish when it is released, watches deliver changes in publication
//! order, and route entries ride the same change feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{ChannelType, CoordinationError, NodeId};
use crate::routing::GlobalRouteInfo;

use super::health::ChannelStats;

/// A node's directory registration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    /// Node identity.
    pub node_id: NodeId,
    /// Host endpoints connect to.
    pub host: String,
    /// Port endpoints connect to.
    pub port: u16,
    /// Node public key handed to attaching endpoints.
    pub public_key: Vec<u8>,
    /// Channels this node serves, with health counters.
    pub channels: Vec<ChannelSupport>,
}

/// One supported channel with its health counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSupport {
    /// Channel type.
    pub channel: ChannelType,
    /// Latest published counters.
    pub stats: ChannelStats,
}

impl ClusterNodeInfo {
    /// True if the node serves the given channel type.
    pub fn supports(&self, channel: ChannelType) -> bool {
        self.channels.iter().any(|support| support.channel == channel)
    }

    /// Counters for one channel, if served.
    pub fn stats_for(&self, channel: ChannelType) -> Option<ChannelStats> {
        self.channels
            .iter()
            .find(|support| support.channel == channel)
            .map(|support| support.stats)
    }
}

/// Namespaces a watch subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryScope {
    /// Node registration entries.
    Nodes,
    /// Route announcements.
    Routes,
}

/// A change observed through a directory watch.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// A node registered.
    NodeAdded(ClusterNodeInfo),
    /// A registered node republished its info (health counters).
    NodeUpdated(ClusterNodeInfo),
    /// A node's ephemeral entry vanished.
    NodeRemoved(NodeId),
    /// A route announcement was published.
    RoutePublished(GlobalRouteInfo),
}

/// Handle releasing an ephemeral registration when dropped.
pub struct Registration {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    /// Wrap a release action.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the registration explicitly.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").finish_non_exhaustive()
    }
}

/// Cancellation handle for a directory watch.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    /// Wrap a cancel action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the watch explicitly.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}

/// Coordination/directory service primitives the core depends on.
pub trait Directory: Send + Sync + 'static {
    /// Register this node with ephemeral semantics: the entry vanishes when
    /// the returned handle is released (or the backing connection drops).
    fn register(&self, node: ClusterNodeInfo) -> Result<Registration, CoordinationError>;

    /// Republish this node's registration entry (health counters).
    fn update(&self, node: ClusterNodeInfo) -> Result<(), CoordinationError>;

    /// Publish a route announcement to all watchers.
    fn publish_route(&self, route: &GlobalRouteInfo) -> Result<(), CoordinationError>;

    /// Watch a namespace; changes are sent in publication order.
    fn watch(
        &self,
        scope: DirectoryScope,
        sender: mpsc::UnboundedSender<DirectoryEvent>,
    ) -> Result<WatchHandle, CoordinationError>;

    /// Close the directory connection.
    fn close(&self);
}

struct WatchEntry {
    id: u64,
    scope: DirectoryScope,
    sender: mpsc::UnboundedSender<DirectoryEvent>,
}

#[derive(Default)]
struct LocalDirectoryInner {
    nodes: Mutex<HashMap<NodeId, String>>,
    watches: Mutex<Vec<WatchEntry>>,
    watch_seq: AtomicU64,
    reachable: AtomicBool,
    closed: AtomicBool,
}

/// In-process [`Directory`] with ephemeral-registration semantics.
///
/// Values round-trip through JSON the way a real coordination service stores
/// them, so codec failures surface here rather than only in production.
/// `set_reachable(false)` simulates a partition for degraded-mode handling.
#[derive(Clone)]
pub struct LocalDirectory {
    inner: Arc<LocalDirectoryInner>,
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDirectory {
    /// Create a reachable, empty directory.
    pub fn new() -> Self {
        let inner = LocalDirectoryInner::default();
        inner.reachable.store(true, Ordering::Release);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Simulate directory reachability (network partition when `false`).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::Release);
    }

    /// Registered nodes, decoded from their stored entries.
    pub fn nodes(&self) -> Vec<ClusterNodeInfo> {
        self.inner
            .nodes
            .lock()
            .values()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }

    fn check_open(&self) -> Result<(), CoordinationError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoordinationError::Closed);
        }
        if !self.inner.reachable.load(Ordering::Acquire) {
            return Err(CoordinationError::Unavailable("directory partitioned".into()));
        }
        Ok(())
    }

    fn emit(&self, scope: DirectoryScope, event: &DirectoryEvent) {
        let mut watches = self.inner.watches.lock();
        watches.retain(|watch| {
            watch.scope != scope || watch.sender.send(event.clone()).is_ok()
        });
    }

    fn remove_node(&self, node_id: &NodeId) {
        if self.inner.nodes.lock().remove(node_id).is_some() {
            debug!(node = %node_id, "ephemeral registration released");
            self.emit(DirectoryScope::Nodes, &DirectoryEvent::NodeRemoved(node_id.clone()));
        }
    }
}

impl Directory for LocalDirectory {
    fn register(&self, node: ClusterNodeInfo) -> Result<Registration, CoordinationError> {
        self.check_open()?;
        let raw = serde_json::to_string(&node)
            .map_err(|err| CoordinationError::Codec(err.to_string()))?;
        let node_id = node.node_id.clone();
        self.inner.nodes.lock().insert(node_id.clone(), raw);
        self.emit(DirectoryScope::Nodes, &DirectoryEvent::NodeAdded(node));

        let directory = self.clone();
        Ok(Registration::new(move || directory.remove_node(&node_id)))
    }

    fn update(&self, node: ClusterNodeInfo) -> Result<(), CoordinationError> {
        self.check_open()?;
        let raw = serde_json::to_string(&node)
            .map_err(|err| CoordinationError::Codec(err.to_string()))?;
        self.inner.nodes.lock().insert(node.node_id.clone(), raw);
        self.emit(DirectoryScope::Nodes, &DirectoryEvent::NodeUpdated(node));
        Ok(())
    }

    fn publish_route(&self, route: &GlobalRouteInfo) -> Result<(), CoordinationError> {
        self.check_open()?;
        // Round-trip through the stored representation like a real directory.
        let raw = serde_json::to_string(route)
            .map_err(|err| CoordinationError::Codec(err.to_string()))?;
        let stored: GlobalRouteInfo = serde_json::from_str(&raw)
            .map_err(|err| CoordinationError::Codec(err.to_string()))?;
        self.emit(DirectoryScope::Routes, &DirectoryEvent::RoutePublished(stored));
        Ok(())
    }

    fn watch(
        &self,
        scope: DirectoryScope,
        sender: mpsc::UnboundedSender<DirectoryEvent>,
    ) -> Result<WatchHandle, CoordinationError> {
        self.check_open()?;
        let id = self.inner.watch_seq.fetch_add(1, Ordering::Relaxed);

        // New node watchers first see the current membership.
        if scope == DirectoryScope::Nodes {
            for node in self.nodes() {
                let _ = sender.send(DirectoryEvent::NodeAdded(node));
            }
        }

        self.inner.watches.lock().push(WatchEntry { id, scope, sender });

        let directory = self.clone();
        Ok(WatchHandle::new(move || {
            directory.inner.watches.lock().retain(|watch| watch.id != id);
        }))
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.watches.lock().clear();
        let node_ids: Vec<NodeId> = self.inner.nodes.lock().keys().cloned().collect();
        for node_id in node_ids {
            self.inner.nodes.lock().remove(&node_id);
        }
    }
}
