//! Shared types for the barberline client: wire models, the real-time event
//! protocol and the error taxonomy.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
