//! Event relay.
//!
//! When a node receives an event addressed to an endpoint it does not own, it
//! consults its route-table replica and forwards the event to the owning node
//! instead of dropping it. Events with no known route are queued briefly and
//! retried, then dropped with a logged delivery failure.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::constants::{RELAY_MAX_ATTEMPTS, RELAY_RETRY_INTERVAL};
use crate::core::{CoordinationError, EndpointKey, NodeId};

use super::table::RouteTable;

/// An event addressed to an endpoint; the payload is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEvent {
    /// Target endpoint.
    pub endpoint: EndpointKey,
    /// Opaque event payload.
    pub payload: Vec<u8>,
}

/// Cross-node event transport the relay forwards through.
pub trait NodeLink: Send + Sync + 'static {
    /// Forward an event to the node owning the endpoint's session.
    fn forward(&self, node: &NodeId, event: &EndpointEvent) -> Result<(), CoordinationError>;
}

/// Local delivery into this node's session layer.
pub trait LocalSink: Send + Sync + 'static {
    /// Deliver an event to a locally owned session.
    fn deliver_local(&self, event: &EndpointEvent);
}

struct QueuedEvent {
    event: EndpointEvent,
    attempts: u32,
}

/// Relays events to whichever node owns the target endpoint's session.
pub struct EventRelay {
    local_node: NodeId,
    table: Arc<RouteTable>,
    link: Arc<dyn NodeLink>,
    sink: Arc<dyn LocalSink>,
    queue: Mutex<VecDeque<QueuedEvent>>,
}

impl EventRelay {
    /// Create a relay over this node's route-table replica.
    pub fn new(
        local_node: NodeId,
        table: Arc<RouteTable>,
        link: Arc<dyn NodeLink>,
        sink: Arc<dyn LocalSink>,
    ) -> Self {
        Self {
            local_node,
            table,
            link,
            sink,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliver an event, locally or by forwarding to the owning node.
    ///
    /// Events with no known route are queued for retry.
    pub fn deliver(&self, event: EndpointEvent) {
        self.deliver_inner(event, 0);
    }

    fn deliver_inner(&self, event: EndpointEvent, attempts: u32) {
        match self.table.lookup(&event.endpoint) {
            Some(owner) if owner == self.local_node => {
                self.sink.deliver_local(&event);
            }
            Some(owner) => match self.link.forward(&owner, &event) {
                Ok(()) => {
                    debug!(endpoint = %event.endpoint, node = %owner, "event forwarded");
                }
                Err(err) => {
                    debug!(endpoint = %event.endpoint, node = %owner, %err, "forward failed, queueing");
                    self.enqueue(event, attempts + 1);
                }
            },
            None => {
                self.enqueue(event, attempts + 1);
            }
        }
    }

    fn enqueue(&self, event: EndpointEvent, attempts: u32) {
        if attempts >= RELAY_MAX_ATTEMPTS {
            warn!(
                endpoint = %event.endpoint,
                attempts,
                "event delivery failed: no route to endpoint"
            );
            return;
        }
        self.queue.lock().push_back(QueuedEvent { event, attempts });
    }

    /// Retry everything in the queue once.
    ///
    /// Exposed separately from the background loop so callers can drive
    /// retries deterministically.
    pub fn retry_pending(&self) {
        let drained: Vec<QueuedEvent> = self.queue.lock().drain(..).collect();
        for queued in drained {
            self.deliver_inner(queued.event, queued.attempts);
        }
    }

    /// Number of events waiting for a route.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run the periodic retry loop until shutdown.
    pub async fn run_retry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RELAY_RETRY_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.retry_pending(),
            }
        }
    }
}
