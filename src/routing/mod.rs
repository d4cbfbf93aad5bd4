//! Cluster route table and event relay.
//!
//! Per-node replica of the cluster-wide endpoint-to-owner map, converging
//! under at-least-once, out-of-order directory delivery via generation
//! counters, plus the relay that forwards events to the owning node.

mod relay;
mod route;
mod table;

pub use relay::*;
pub use route::*;
pub use table::*;
