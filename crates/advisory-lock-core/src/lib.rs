//! Core traits and types for distributed locks.
//!
//! Backends implement [`data::LockBackend`] and get connection lifecycle,
//! keepalive, timeouts, cancellation and blocking entry points from this
//! crate.

pub mod cancellation;
pub mod data;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod timeout;
pub mod traits;

pub use error::{LockError, LockResult};
pub use prelude::*;
