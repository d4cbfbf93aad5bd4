//! Endpoint sessions.
//!
//! One actor task per endpoint owns the session state machine; the manager
//! indexes actors by endpoint key and keeps route announcements in step with
//! session lifecycle.

mod actor;
mod machine;
mod manager;

pub use actor::*;
pub use machine::*;
pub use manager::*;
