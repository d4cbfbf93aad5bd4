//! Session actor task.
//!
//! Each endpoint session runs as one tokio task owning its [`SessionCore`]
//! exclusively; everything reaches it through the mailbox, so the state
//! machine needs no locks. The actor supplies the two things the core
//! deliberately lacks: the clock for long-poll deadlines and the oneshot
//! replies back to transports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::core::constants::{
    DEFAULT_LONG_POLL_MAX_WAIT, LONG_POLL_WAIT_CEILING, SESSION_MAILBOX_CAPACITY,
};
use crate::core::{SessionError, StateReader, Subsystem};
use crate::protocol::SyncRequest;

use super::machine::{SessionCore, SyncOutcome};

/// Events a session actor consumes.
#[derive(Debug)]
pub enum SessionEvent {
    /// A sync request; the response bytes go back through `reply`.
    ///
    /// Dropping `reply` without sending tells the waiting transport the
    /// session closed underneath it.
    Sync {
        /// Decoded request.
        request: SyncRequest,
        /// Response channel.
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// Server-side state changed for one subsystem.
    ChangeReady {
        /// Subsystem that changed.
        subsystem: Subsystem,
    },
    /// The endpoint's channel closed; terminate the session.
    ChannelClosed,
}

/// Cheap handle to a session actor's mailbox.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Send an event, waiting for mailbox space.
    pub async fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SessionError::MailboxUnavailable)
    }

    /// Send an event without waiting; drops the event if the mailbox is full.
    pub fn try_send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.tx
            .try_send(event)
            .map_err(|_| SessionError::MailboxUnavailable)
    }
}

/// Spawn a session actor; `on_closed` runs exactly once when the task exits.
pub fn spawn_session(
    core: SessionCore,
    reader: Arc<dyn StateReader>,
    on_closed: impl FnOnce() + Send + 'static,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(SESSION_MAILBOX_CAPACITY);
    tokio::spawn(run(core, reader, rx, on_closed));
    SessionHandle { tx }
}

async fn run(
    mut core: SessionCore,
    reader: Arc<dyn StateReader>,
    mut rx: mpsc::Receiver<SessionEvent>,
    on_closed: impl FnOnce() + Send + 'static,
) {
    let mut parked: Option<(oneshot::Sender<Vec<u8>>, Instant)> = None;

    loop {
        let event = match &parked {
            Some((_, deadline)) => {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => Some(event),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(*deadline) => None,
                }
            }
            None => match rx.recv().await {
                Some(event) => Some(event),
                None => break,
            },
        };

        match event {
            // Deadline passed with nothing new.
            None => {
                let Some((reply, _)) = parked.take() else { continue };
                match core.answer_parked_no_delta() {
                    Ok(Some(bytes)) => {
                        let _ = reply.send(bytes);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(endpoint = %core.endpoint(), %err, "deadline answer failed");
                    }
                }
            }

            Some(SessionEvent::Sync { request, reply }) => {
                // A newer request supersedes the parked one; the old poll
                // gets its NO_DELTA answer before the new one is handled.
                if let Some((old_reply, _)) = parked.take() {
                    match core.answer_parked_no_delta() {
                        Ok(Some(bytes)) => {
                            let _ = old_reply.send(bytes);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(endpoint = %core.endpoint(), %err, "parked release failed");
                        }
                    }
                }

                match core.handle_sync(&request, reader.as_ref()) {
                    Ok(SyncOutcome::Respond(bytes)) => {
                        let _ = reply.send(bytes);
                    }
                    Ok(SyncOutcome::Park) => {
                        let requested = Duration::from_millis(u64::from(request.max_wait_ms));
                        // Out-of-range waits get the server default, not the
                        // ceiling.
                        let wait = if requested > LONG_POLL_WAIT_CEILING {
                            DEFAULT_LONG_POLL_MAX_WAIT
                        } else {
                            requested
                        };
                        parked = Some((reply, Instant::now() + wait));
                    }
                    Err(err) => {
                        debug!(endpoint = %core.endpoint(), %err, "sync rejected");
                    }
                }
            }

            Some(SessionEvent::ChangeReady { subsystem }) => {
                debug!(endpoint = %core.endpoint(), ?subsystem, "change notification");
                if parked.is_none() {
                    // No poll to answer; the next sync picks it up.
                    continue;
                }
                match core.wake_parked(reader.as_ref()) {
                    Ok(Some(bytes)) => {
                        if let Some((reply, _)) = parked.take() {
                            let _ = reply.send(bytes);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(endpoint = %core.endpoint(), %err, "wake failed");
                        parked = None;
                    }
                }
            }

            Some(SessionEvent::ChannelClosed) => {
                core.close();
                // Dropping the parked sender cancels the waiting transport.
                parked = None;
                break;
            }
        }
    }

    debug!(endpoint = %core.endpoint(), "session terminated");
    on_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelType, ContentHash, EndpointKey, StateReadError, SubsystemSnapshot};
    use crate::protocol::{ClientSubsystemState, ResponseStatus, SyncResponse};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MapReader {
        states: Mutex<HashMap<Subsystem, SubsystemSnapshot>>,
    }

    impl MapReader {
        fn with(subsystem: Subsystem, seq: u64, payload: &[u8]) -> Arc<Self> {
            let reader = Arc::new(Self {
                states: Mutex::new(HashMap::new()),
            });
            reader.set(subsystem, seq, payload);
            reader
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

    fn endpoint() -> EndpointKey {
        EndpointKey::from_public_key(b"actor-endpoint")
    }

    fn sync_request(id: u64, seq: u64, hash: Option<ContentHash>, max_wait_ms: u32) -> SyncRequest {
        SyncRequest {
            endpoint: endpoint(),
            application_token: "app".to_string(),
            channel: if max_wait_ms > 0 {
                ChannelType::SyncLongPoll
            } else {
                ChannelType::SyncRequestResponse
            },
            request_id: id,
            max_wait_ms,
            blocks: vec![ClientSubsystemState {
                subsystem: Subsystem::Configuration,
                seq,
                hash,
                resync_only: false,
            }],
        }
    }

    async fn sync(handle: &SessionHandle, request: SyncRequest) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        handle
            .send(SessionEvent::Sync { request, reply: tx })
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_change_notification_releases_parked_poll() {
        let reader = MapReader::with(Subsystem::Configuration, 5, b"config-v5");
        let handle = spawn_session(SessionCore::new(endpoint()), reader.clone(), || {});

        // First contact establishes the horizon.
        sync(&handle, sync_request(1, 0, None, 0)).await.await.unwrap();

        let hash = ContentHash::of(b"config-v5");
        let parked = sync(&handle, sync_request(2, 5, Some(hash), 30_000)).await;

        reader.set(Subsystem::Configuration, 6, b"config-v6");
        handle
            .send(SessionEvent::ChangeReady {
                subsystem: Subsystem::Configuration,
            })
            .await
            .unwrap();

        let bytes = parked.await.unwrap();
        let response = SyncResponse::decode(&bytes).unwrap();
        assert_eq!(response.request_id, 2);
        assert_eq!(response.blocks[0].status, ResponseStatus::Delta);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_answers_no_delta() {
        let reader = MapReader::with(Subsystem::Configuration, 5, b"config-v5");
        let handle = spawn_session(SessionCore::new(endpoint()), reader.clone(), || {});

        sync(&handle, sync_request(1, 0, None, 0)).await.await.unwrap();

        let hash = ContentHash::of(b"config-v5");
        let parked = sync(&handle, sync_request(2, 5, Some(hash), 30_000)).await;

        let started = Instant::now();
        let bytes = parked.await.unwrap();
        let response = SyncResponse::decode(&bytes).unwrap();
        assert_eq!(response.blocks[0].status, ResponseStatus::NoDelta);
        assert!(started.elapsed() >= Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_wait_falls_back_to_default() {
        let reader = MapReader::with(Subsystem::Configuration, 5, b"config-v5");
        let handle = spawn_session(SessionCore::new(endpoint()), reader.clone(), || {});

        sync(&handle, sync_request(1, 0, None, 0)).await.await.unwrap();

        // One hour, well past the ceiling.
        let hash = ContentHash::of(b"config-v5");
        let parked = sync(&handle, sync_request(2, 5, Some(hash), 3_600_000)).await;

        let started = Instant::now();
        parked.await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_LONG_POLL_MAX_WAIT);
        assert!(elapsed < LONG_POLL_WAIT_CEILING);
    }

    #[tokio::test]
    async fn test_newer_request_supersedes_parked_poll() {
        let reader = MapReader::with(Subsystem::Configuration, 5, b"config-v5");
        let handle = spawn_session(SessionCore::new(endpoint()), reader.clone(), || {});

        sync(&handle, sync_request(1, 0, None, 0)).await.await.unwrap();

        let hash = ContentHash::of(b"config-v5");
        let first = sync(&handle, sync_request(2, 5, Some(hash.clone()), 30_000)).await;
        let second = sync(&handle, sync_request(3, 5, Some(hash), 30_000)).await;

        // The superseded poll resolves NO_DELTA immediately.
        let bytes = first.await.unwrap();
        let response = SyncResponse::decode(&bytes).unwrap();
        assert_eq!(response.request_id, 2);
        assert_eq!(response.blocks[0].status, ResponseStatus::NoDelta);

        // The newer poll is now the parked one.
        reader.set(Subsystem::Configuration, 6, b"config-v6");
        handle
            .send(SessionEvent::ChangeReady {
                subsystem: Subsystem::Configuration,
            })
            .await
            .unwrap();
        let bytes = second.await.unwrap();
        assert_eq!(SyncResponse::decode(&bytes).unwrap().request_id, 3);
    }

    #[tokio::test]
    async fn test_channel_close_cancels_parked_poll_and_runs_callback() {
        let reader = MapReader::with(Subsystem::Configuration, 5, b"config-v5");
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&closed);
        let handle = spawn_session(SessionCore::new(endpoint()), reader.clone(), move || {
            closed_flag.store(true, Ordering::Release);
        });

        sync(&handle, sync_request(1, 0, None, 0)).await.await.unwrap();
        let hash = ContentHash::of(b"config-v5");
        let parked = sync(&handle, sync_request(2, 5, Some(hash), 30_000)).await;

        handle.send(SessionEvent::ChannelClosed).await.unwrap();

        // Cancelled, not answered.
        assert!(parked.await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closed.load(Ordering::Acquire));

        // Mailbox gone after termination.
        assert!(handle.send(SessionEvent::ChannelClosed).await.is_err());
    }
}
