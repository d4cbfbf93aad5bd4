//! Protocol and scheduling constants.

use std::time::Duration;

/// Sync envelope protocol version.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Server-side long-poll wait applied when a client requests more than
/// [`LONG_POLL_WAIT_CEILING`].
///
/// On expiry the session answers NO_DELTA rather than blocking indefinitely.
pub const DEFAULT_LONG_POLL_MAX_WAIT: Duration = Duration::from_secs(60);

/// Upper bound a client may request for long-poll wait; requests beyond it
/// fall back to [`DEFAULT_LONG_POLL_MAX_WAIT`].
pub const LONG_POLL_WAIT_CEILING: Duration = Duration::from_secs(300);

/// Capacity of a session actor's mailbox.
///
/// A single endpoint never has more than a handful of in-flight events; the
/// bound exists to surface runaway transports early.
pub const SESSION_MAILBOX_CAPACITY: usize = 64;

/// Initial backoff for retrying route publications while the directory is
/// unreachable.
pub const ROUTE_RETRY_INITIAL: Duration = Duration::from_millis(500);

/// Backoff ceiling for route publication retries.
pub const ROUTE_RETRY_MAX: Duration = Duration::from_secs(30);

/// Exponential backoff multiplier for route publication retries.
pub const ROUTE_RETRY_MULTIPLIER: u32 = 2;

/// How many times an event with no known route is retried before it is
/// dropped with a logged delivery failure.
pub const RELAY_MAX_ATTEMPTS: u32 = 3;

/// Interval between relay retry ticks.
pub const RELAY_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Interval at which a node republishes its per-channel health counters.
pub const HEALTH_REPUBLISH_INTERVAL: Duration = Duration::from_secs(10);
