//! Per-channel health counters.
//!
//! Each node continuously republishes these through the directory; the
//! bootstrap tier uses the pending/processed ratio to rank candidate nodes
//! for newly attaching endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::ChannelType;

/// Point-in-time request counters for one channel type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Requests fully processed.
    pub processed: u64,
    /// Requests currently in flight (including parked long polls).
    pub pending: u64,
    /// Requests ever received.
    pub total_requests: u64,
}

impl ChannelStats {
    /// Load ratio used by the bootstrap ranking: pending over processed.
    ///
    /// A node that has processed nothing but has work pending ranks worst.
    pub fn load_ratio(&self) -> f64 {
        if self.processed == 0 {
            if self.pending == 0 { 0.0 } else { f64::INFINITY }
        } else {
            self.pending as f64 / self.processed as f64
        }
    }
}

#[derive(Debug, Default)]
struct ChannelCounters {
    processed: AtomicU64,
    pending: AtomicU64,
    total_requests: AtomicU64,
}

/// Live counters shared between the session layer and the membership
/// republish loop.
#[derive(Debug, Default)]
pub struct HealthCounters {
    sync_request_response: ChannelCounters,
    sync_long_poll: ChannelCounters,
    async_event: ChannelCounters,
}

impl HealthCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, channel: ChannelType) -> &ChannelCounters {
        match channel {
            ChannelType::SyncRequestResponse => &self.sync_request_response,
            ChannelType::SyncLongPoll => &self.sync_long_poll,
            ChannelType::AsyncEvent => &self.async_event,
        }
    }

    /// Record request arrival.
    pub fn request_started(&self, channel: ChannelType) {
        let counters = self.channel(channel);
        counters.total_requests.fetch_add(1, Ordering::Relaxed);
        counters.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Record request completion.
    pub fn request_finished(&self, channel: ChannelType) {
        let counters = self.channel(channel);
        counters.pending.fetch_sub(1, Ordering::Relaxed);
        counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot one channel's counters.
    pub fn stats(&self, channel: ChannelType) -> ChannelStats {
        let counters = self.channel(channel);
        ChannelStats {
            processed: counters.processed.load(Ordering::Relaxed),
            pending: counters.pending.load(Ordering::Relaxed),
            total_requests: counters.total_requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle_counts() {
        let counters = HealthCounters::new();
        counters.request_started(ChannelType::SyncLongPoll);
        counters.request_started(ChannelType::SyncLongPoll);
        counters.request_finished(ChannelType::SyncLongPoll);

        let stats = counters.stats(ChannelType::SyncLongPoll);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processed, 1);

        // Other channels untouched.
        assert_eq!(counters.stats(ChannelType::AsyncEvent), ChannelStats::default());
    }

    #[test]
    fn test_load_ratio() {
        let idle = ChannelStats { processed: 0, pending: 0, total_requests: 0 };
        assert_eq!(idle.load_ratio(), 0.0);

        let cold_and_busy = ChannelStats { processed: 0, pending: 3, total_requests: 3 };
        assert!(cold_and_busy.load_ratio().is_infinite());

        let warm = ChannelStats { processed: 10, pending: 5, total_requests: 15 };
        assert_eq!(warm.load_ratio(), 0.5);
    }
}
