//! Session manager.
//!
//! Owns the endpoint-to-actor map, creates sessions on first contact, and
//! keeps the cluster informed: an ADD route announcement when a session is
//! created, a DELETE when it terminates. Generations are per-endpoint
//! counters local to this node, so a late-arriving ADD can never resurrect
//! a session its DELETE already retracted.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::cluster::HealthCounters;
use crate::core::{EndpointKey, FleetError, SessionError, StateReader, Subsystem};
use crate::core::{NodeId, StateReadError};
use crate::protocol::SyncRequest;
use crate::routing::{GlobalRouteInfo, RoutePublisher, RouteTableAddress};

use super::actor::{SessionEvent, SessionHandle, spawn_session};
use super::machine::SessionCore;

/// Tenant and user an endpoint resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    /// Tenant owning the endpoint.
    pub tenant_id: String,
    /// User the endpoint is attached to.
    pub user_id: String,
}

/// Resolves an endpoint's tenant and user from the profile store.
pub trait RouteBinder: Send + Sync + 'static {
    /// Look up the binding for an endpoint within an application.
    fn bind(&self, endpoint: &EndpointKey, application_token: &str) -> RouteBinding;
}

struct ActiveSession {
    handle: SessionHandle,
    route: GlobalRouteInfo,
}

/// Creates, indexes, and terminates endpoint session actors.
pub struct SessionManager {
    node_id: NodeId,
    reader: Arc<dyn StateReader>,
    binder: Arc<dyn RouteBinder>,
    publisher: Arc<dyn RoutePublisher>,
    counters: Arc<HealthCounters>,
    sessions: Arc<DashMap<EndpointKey, ActiveSession>>,
    // Survives session teardown so a recreated session's ADD outranks the
    // previous session's DELETE.
    generations: Arc<DashMap<EndpointKey, u64>>,
}

impl SessionManager {
    /// Create a manager for this node.
    pub fn new(
        node_id: NodeId,
        reader: Arc<dyn StateReader>,
        binder: Arc<dyn RouteBinder>,
        publisher: Arc<dyn RoutePublisher>,
        counters: Arc<HealthCounters>,
    ) -> Self {
        Self {
            node_id,
            reader,
            binder,
            publisher,
            counters,
            sessions: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
        }
    }

    /// Process one decoded sync request end to end.
    ///
    /// Creates the session actor on first contact, announces the route, and
    /// waits for the response bytes. Calling this twice with the same request
    /// returns byte-identical responses.
    pub async fn process_sync(&self, request: SyncRequest) -> Result<Vec<u8>, FleetError> {
        let channel = request.channel;
        self.counters.request_started(channel);

        let result = self.process_sync_inner(request).await;

        self.counters.request_finished(channel);
        result
    }

    async fn process_sync_inner(&self, request: SyncRequest) -> Result<Vec<u8>, FleetError> {
        let handle = self.ensure_session(&request.endpoint, &request.application_token);

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(SessionEvent::Sync {
                request,
                reply: reply_tx,
            })
            .await?;

        reply_rx.await.map_err(|_| SessionError::Closed.into())
    }

    fn ensure_session(&self, endpoint: &EndpointKey, application_token: &str) -> SessionHandle {
        if let Some(session) = self.sessions.get(endpoint) {
            return session.handle.clone();
        }

        // Entry lock prevents two concurrent first contacts from spawning
        // two actors for the same endpoint.
        let entry = self.sessions.entry(endpoint.clone()).or_insert_with(|| {
            let generation = self.next_generation(endpoint);
            let route = self.build_add_route(endpoint, application_token, generation);
            info!(endpoint = %endpoint, generation, "session created");
            self.publisher.publish(route.clone());

            let sessions = Arc::clone(&self.sessions);
            let generations = Arc::clone(&self.generations);
            let publisher = Arc::clone(&self.publisher);
            let closing_endpoint = endpoint.clone();
            let closing_route = route.clone();

            let handle = spawn_session(
                SessionCore::new(endpoint.clone()),
                Arc::clone(&self.reader),
                move || {
                    // The retraction generation is reserved before the map
                    // entry disappears: a first contact racing this teardown
                    // can only re-create the session after the removal, so
                    // its ADD always draws a higher generation than this
                    // DELETE.
                    let generation = {
                        let mut slot = generations.entry(closing_endpoint.clone()).or_insert(0);
                        *slot += 1;
                        *slot
                    };
                    sessions.remove(&closing_endpoint);
                    info!(endpoint = %closing_endpoint, generation, "session terminated, retracting route");
                    publisher.publish(GlobalRouteInfo::delete(
                        closing_route.tenant_id.clone(),
                        closing_route.user_id.clone(),
                        closing_route.address.clone(),
                        generation,
                    ));
                },
            );

            ActiveSession { handle, route }
        });
        entry.handle.clone()
    }

    fn next_generation(&self, endpoint: &EndpointKey) -> u64 {
        let mut slot = self.generations.entry(endpoint.clone()).or_insert(0);
        *slot += 1;
        *slot
    }

    fn build_add_route(
        &self,
        endpoint: &EndpointKey,
        application_token: &str,
        generation: u64,
    ) -> GlobalRouteInfo {
        let binding = self.binder.bind(endpoint, application_token);
        let (cf_version, ucf_hash) = match self
            .reader
            .current_state(endpoint, Subsystem::Configuration)
        {
            Ok(snapshot) => (snapshot.seq as u32, Some(snapshot.hash)),
            Err(StateReadError::Unavailable(_)) | Err(StateReadError::Corrupt(_)) => (0, None),
        };
        GlobalRouteInfo::add(
            binding.tenant_id,
            binding.user_id,
            RouteTableAddress::new(endpoint.clone(), application_token, self.node_id.clone()),
            cf_version,
            ucf_hash,
            generation,
        )
    }

    /// Notify a session that server-side state changed.
    ///
    /// No-op for endpoints without a live session; they will see the change
    /// on their next sync.
    pub fn notify_change(&self, endpoint: &EndpointKey, subsystem: Subsystem) {
        if let Some(session) = self.sessions.get(endpoint) {
            if session
                .handle
                .try_send(SessionEvent::ChangeReady { subsystem })
                .is_err()
            {
                debug!(endpoint = %endpoint, "change notification dropped, session mailbox gone");
            }
        }
    }

    /// Terminate the session for an endpoint whose channel closed.
    pub fn close_channel(&self, endpoint: &EndpointKey) {
        if let Some(session) = self.sessions.get(endpoint) {
            let _ = session.handle.try_send(SessionEvent::ChannelClosed);
        }
    }

    /// Routes of all currently active sessions, for re-announcement after a
    /// directory reconnect.
    pub fn active_routes(&self) -> Vec<GlobalRouteInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().route.clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
