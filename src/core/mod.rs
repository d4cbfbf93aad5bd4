//! Core types, collaborator contracts, constants, and error taxonomy.

pub mod constants;
mod error;
mod traits;
mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
