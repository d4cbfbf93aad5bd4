//! Delta/resync engine.
//!
//! Decides NO_DELTA / DELTA / RESYNC per subsystem and produces the payload.

mod engine;

pub use engine::*;
