//! Cluster coordination.
//!
//! Directory abstraction over the coordination service, membership tracking
//! with ordered change dispatch, route announcement with outage absorption,
//! per-channel health counters, and bootstrap node ranking.

mod announcer;
mod directory;
mod health;
mod membership;
mod ranking;

pub use announcer::*;
pub use directory::*;
pub use health::*;
pub use membership::*;
pub use ranking::*;
