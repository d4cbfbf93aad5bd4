//! Pure per-endpoint session state machine.
//!
//! Holds everything a session knows between requests: the lifecycle state,
//! the per-subsystem delta horizon, the last served request id with its
//! encoded response for replay, and the parked long-poll request if any.
//! No I/O and no clocks live here; the actor supplies both.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::core::{
    ContentHash, EndpointKey, FleetError, ProtocolError, SessionError, StateReader, Subsystem,
};
use crate::delta::{ServedState, evaluate};
use crate::protocol::{
    ClientSubsystemState, ResponseStatus, SubsystemStatus, SyncRequest, SyncResponse,
};

/// Lifecycle of one endpoint session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No channel attached yet.
    Disconnected,
    /// First request received, no response served yet.
    Connecting,
    /// At least one response served; ready for the next request.
    Active,
    /// A long poll is parked waiting for changes or its deadline.
    AwaitingChanges,
    /// Channel closed; the session accepts no further requests.
    Closing,
}

/// What the actor should do with a handled request.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Send these bytes to the client now.
    Respond(Vec<u8>),
    /// Hold the reply until a change arrives or the deadline passes.
    Park,
}

/// Session memory and decision logic for one endpoint.
pub struct SessionCore {
    endpoint: EndpointKey,
    state: SessionState,
    served: HashMap<Subsystem, ServedState>,
    last_request_id: Option<u64>,
    cached: Option<(u64, Vec<u8>)>,
    parked: Option<SyncRequest>,
}

impl SessionCore {
    /// Create a session in the disconnected state.
    pub fn new(endpoint: EndpointKey) -> Self {
        Self {
            endpoint,
            state: SessionState::Disconnected,
            served: HashMap::new(),
            last_request_id: None,
            cached: None,
            parked: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Endpoint this session belongs to.
    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    /// True while a long poll is parked.
    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }

    /// Configuration version and hash of the last served configuration state,
    /// carried in route announcements.
    pub fn configuration_status(&self) -> (u32, Option<ContentHash>) {
        match self.served.get(&Subsystem::Configuration) {
            Some(served) => (served.seq as u32, Some(served.hash.clone())),
            None => (0, None),
        }
    }

    /// Handle one sync request.
    ///
    /// Retransmissions of the last served request id replay the cached bytes
    /// without re-evaluating anything. Request ids behind the last served one
    /// that are not replays force a full resync. Otherwise each block gets a
    /// delta decision; a long poll whose blocks are all NO_DELTA parks.
    pub fn handle_sync(
        &mut self,
        request: &SyncRequest,
        reader: &dyn StateReader,
    ) -> Result<SyncOutcome, FleetError> {
        if self.state == SessionState::Closing {
            return Err(SessionError::Closed.into());
        }
        if self.state == SessionState::Disconnected {
            self.state = SessionState::Connecting;
        }

        if let Some((cached_id, bytes)) = &self.cached {
            if *cached_id == request.request_id {
                debug!(endpoint = %self.endpoint, request_id = request.request_id, "replaying cached response");
                return Ok(SyncOutcome::Respond(bytes.clone()));
            }
        }

        if let Some(last) = self.last_request_id {
            if request.request_id < last {
                let err = ProtocolError::OutOfOrder {
                    last_served: last,
                    received: request.request_id,
                };
                warn!(endpoint = %self.endpoint, %err, "forcing resync");
                let blocks = self.evaluate_blocks(&request.blocks, reader, true);
                // Not cached: replay detection stays keyed to the newest id.
                let bytes = encode_response(request.request_id, blocks)?;
                return Ok(SyncOutcome::Respond(bytes));
            }
        }

        let blocks = self.evaluate_blocks(&request.blocks, reader, false);
        if request.is_long_poll() && all_no_delta(&blocks) {
            self.parked = Some(request.clone());
            self.state = SessionState::AwaitingChanges;
            return Ok(SyncOutcome::Park);
        }

        Ok(SyncOutcome::Respond(self.finish_response(request.request_id, blocks)?))
    }

    /// Re-evaluate the parked request after a change notification.
    ///
    /// Returns the response bytes if anything changed; `None` keeps the poll
    /// parked.
    pub fn wake_parked(&mut self, reader: &dyn StateReader) -> Result<Option<Vec<u8>>, FleetError> {
        let Some(request) = self.parked.clone() else {
            return Ok(None);
        };

        let blocks = self.evaluate_blocks(&request.blocks, reader, false);
        if all_no_delta(&blocks) {
            return Ok(None);
        }

        self.parked = None;
        Ok(Some(self.finish_response(request.request_id, blocks)?))
    }

    /// Answer the parked request with NO_DELTA on every block.
    ///
    /// Used at the long-poll deadline and when a newer request supersedes
    /// the parked one.
    pub fn answer_parked_no_delta(&mut self) -> Result<Option<Vec<u8>>, FleetError> {
        let Some(request) = self.parked.take() else {
            return Ok(None);
        };

        let blocks = request
            .blocks
            .iter()
            .map(|declared| SubsystemStatus::no_delta(declared.subsystem, declared.seq))
            .collect();
        Ok(Some(self.finish_response(request.request_id, blocks)?))
    }

    /// Mark the session closing. Any parked request is discarded.
    pub fn close(&mut self) {
        self.parked = None;
        self.state = SessionState::Closing;
    }

    fn evaluate_blocks(
        &mut self,
        declared_blocks: &[ClientSubsystemState],
        reader: &dyn StateReader,
        force_resync: bool,
    ) -> Vec<SubsystemStatus> {
        declared_blocks
            .iter()
            .map(|declared| {
                let current = match reader.current_state(&self.endpoint, declared.subsystem) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        warn!(
                            endpoint = %self.endpoint,
                            subsystem = ?declared.subsystem,
                            %err,
                            "state read failed, failing block"
                        );
                        return SubsystemStatus::failed(declared.subsystem, declared.seq);
                    }
                };

                let declared = if force_resync {
                    ClientSubsystemState {
                        resync_only: true,
                        ..declared.clone()
                    }
                } else {
                    declared.clone()
                };

                let prior = self.served.get(&declared.subsystem);
                let block = evaluate(prior, &declared, &current);
                if matches!(block.status, ResponseStatus::Delta | ResponseStatus::Resync) {
                    self.served
                        .insert(declared.subsystem, ServedState::from_snapshot(&current));
                }
                block
            })
            .collect()
    }

    fn finish_response(
        &mut self,
        request_id: u64,
        blocks: Vec<SubsystemStatus>,
    ) -> Result<Vec<u8>, FleetError> {
        let bytes = encode_response(request_id, blocks)?;
        self.last_request_id = Some(request_id);
        self.cached = Some((request_id, bytes.clone()));
        self.state = SessionState::Active;
        Ok(bytes)
    }
}

fn all_no_delta(blocks: &[SubsystemStatus]) -> bool {
    blocks
        .iter()
        .all(|block| block.status == ResponseStatus::NoDelta)
}

fn encode_response(request_id: u64, blocks: Vec<SubsystemStatus>) -> Result<Vec<u8>, FleetError> {
    SyncResponse { request_id, blocks }
        .encode()
        .map_err(|err| ProtocolError::Malformed(err.to_string()).into())
}
