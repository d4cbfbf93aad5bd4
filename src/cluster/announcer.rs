//! Route announcer with degraded-mode queueing.
//!
//! Route mutations may wait briefly on directory acknowledgment but never
//! indefinitely: when the directory is unreachable the node keeps serving
//! existing sessions locally, queues route publications, and retries them
//! with bounded exponential backoff. Reconnection triggers a full
//! re-announcement of currently active sessions so stale routes are never
//! silently left to rot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::core::CoordinationError;
use crate::core::constants::{ROUTE_RETRY_INITIAL, ROUTE_RETRY_MAX, ROUTE_RETRY_MULTIPLIER};
use crate::routing::{GlobalRouteInfo, RoutePublisher};

use super::directory::Directory;

/// Supplies the routes of currently active sessions for re-announcement.
pub type ActiveRoutes = Box<dyn Fn() -> Vec<GlobalRouteInfo> + Send + Sync>;

/// Publishes route announcements to the directory, absorbing outages.
pub struct RouteAnnouncer {
    directory: Arc<dyn Directory>,
    pending: Mutex<VecDeque<GlobalRouteInfo>>,
    degraded: AtomicBool,
    wake: Notify,
    active_routes: Mutex<Option<ActiveRoutes>>,
}

impl RouteAnnouncer {
    /// Create an announcer over a directory.
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            pending: Mutex::new(VecDeque::new()),
            degraded: AtomicBool::new(false),
            wake: Notify::new(),
            active_routes: Mutex::new(None),
        }
    }

    /// Install the active-session supplier used after reconnection.
    pub fn set_active_routes(&self, supplier: ActiveRoutes) {
        *self.active_routes.lock() = Some(supplier);
    }

    /// True while route publications are being queued.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Queued publications waiting for the directory to return.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn enqueue(&self, route: GlobalRouteInfo) {
        self.pending.lock().push_back(route);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!("directory unreachable, entering degraded mode");
        }
        self.wake.notify_one();
    }

    /// Retry queued publications once.
    ///
    /// Returns `Ok(true)` if the queue fully drained. Exposed separately from
    /// the background loop so callers can drive retries deterministically.
    pub fn retry_pending(&self) -> Result<bool, CoordinationError> {
        loop {
            let Some(route) = self.pending.lock().pop_front() else {
                break;
            };
            if let Err(err) = self.directory.publish_route(&route) {
                self.pending.lock().push_front(route);
                return Err(err);
            }
        }

        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("directory reachable again, re-announcing active sessions");
            self.reannounce_active();
        }
        Ok(true)
    }

    fn reannounce_active(&self) {
        let routes = match self.active_routes.lock().as_ref() {
            Some(supplier) => supplier(),
            None => Vec::new(),
        };
        for route in routes {
            if let Err(err) = self.directory.publish_route(&route) {
                debug!(%err, "re-announcement interrupted, queueing");
                self.enqueue(route);
                return;
            }
        }
    }

    /// Run the retry loop until shutdown, backing off exponentially while
    /// the directory stays unreachable.
    pub async fn run_retry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = ROUTE_RETRY_INITIAL;
        loop {
            if self.pending_len() == 0 {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = self.wake.notified() => {}
                }
            }

            match self.retry_pending() {
                Ok(_) => backoff = ROUTE_RETRY_INITIAL,
                Err(err) => {
                    debug!(%err, backoff_ms = backoff.as_millis() as u64, "route retry failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * ROUTE_RETRY_MULTIPLIER).min(ROUTE_RETRY_MAX);
                }
            }
        }
    }
}

impl RoutePublisher for RouteAnnouncer {
    fn publish(&self, route: GlobalRouteInfo) {
        if self.is_degraded() {
            // Preserve publication order behind the queued backlog.
            self.enqueue(route);
            return;
        }
        if self.directory.publish_route(&route).is_err() {
            self.enqueue(route);
        }
    }
}
