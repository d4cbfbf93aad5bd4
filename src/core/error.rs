//! Error taxonomy for the operations tier.
//!
//! Each layer has its own error type; `FleetError` folds them together at the
//! node boundary. The design rule is that no failure path drops an in-flight
//! request: every error resolves to either a well-formed protocol response or
//! an explicit session/channel closure.

use thiserror::Error;

/// Channel-level faults reported by a transport.
///
/// These close the session; they are logged but never surfaced to the client.
#[derive(Debug, Error, Clone)]
pub enum TransportFault {
    /// The peer closed the channel.
    #[error("channel closed by peer")]
    Closed,

    /// I/O failure on the channel.
    #[error("channel i/o failure: {0}")]
    Io(String),

    /// The channel idled past its timeout.
    #[error("channel timed out")]
    TimedOut,
}

/// Malformed or out-of-window requests.
///
/// Protocol errors keep the channel open; the response carries RESYNC.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request id is behind the last served response and is not a replay.
    #[error("out-of-order request: last served {last_served}, got {received}")]
    OutOfOrder {
        /// Request id of the last served response.
        last_served: u64,
        /// Request id received.
        received: u64,
    },

    /// Envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Coordination/directory failures.
#[derive(Debug, Error, Clone)]
pub enum CoordinationError {
    /// The directory is unreachable; the node runs degraded until it returns.
    #[error("directory unreachable: {0}")]
    Unavailable(String),

    /// The directory connection was closed locally.
    #[error("directory closed")]
    Closed,

    /// A directory value failed to serialize or deserialize.
    #[error("directory value codec failure: {0}")]
    Codec(String),
}

/// A single subsystem's state source failed.
///
/// Isolated at subsystem granularity: sibling subsystems in the same envelope
/// are still answered.
#[derive(Debug, Error, Clone)]
pub enum StateReadError {
    /// The backing store is unreachable.
    #[error("state source unavailable: {0}")]
    Unavailable(String),

    /// The stored state failed integrity checks.
    #[error("state source corrupt: {0}")]
    Corrupt(String),
}

/// Session lifecycle failures.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// The session task has terminated.
    #[error("session closed")]
    Closed,

    /// The session mailbox is gone (task panicked or shut down).
    #[error("session mailbox unavailable")]
    MailboxUnavailable,
}

/// Top-level operations-tier errors.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Coordination error.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// State read error.
    #[error("state read error: {0}")]
    StateRead(#[from] StateReadError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Corrupt or missing local node identity at startup.
    ///
    /// The node refuses to join the cluster.
    #[error("fatal: {0}")]
    Fatal(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
