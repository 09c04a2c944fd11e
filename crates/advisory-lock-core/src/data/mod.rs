//! Connection-backed lock acquisition.
//!
//! [`DatabaseConnection`] wraps one session and its [`ConnectionMonitor`].
//! [`AcquisitionEngine`] drives a [`LockBackend`] through open, wait, abort
//! and release, producing a [`DbLockHandle`] on success.

pub mod connection;
pub mod engine;
pub mod handle;
pub mod monitor;
pub mod multiplex;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{DatabaseConnection, Ownership};
pub use engine::{AcquireRequest, AcquisitionEngine, ConnectionSource, EngineOptions, LockBackend};
pub use handle::DbLockHandle;
pub use monitor::{ConnectionMonitor, MonitoringHandle};
pub use multiplex::MultiplexedConnectionPool;
pub use session::DatabaseSession;
