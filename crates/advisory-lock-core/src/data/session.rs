//! The physical database session behind a [`DatabaseConnection`](super::DatabaseConnection).

use std::future::Future;
use std::time::Duration;

use crate::error::LockResult;

/// A single physical connection to the lock server.
///
/// Implementations only need to perform the I/O. Serialization of commands,
/// transaction bookkeeping and keepalive scheduling are handled by
/// [`DatabaseConnection`](super::DatabaseConnection) and
/// [`ConnectionMonitor`](super::ConnectionMonitor).
pub trait DatabaseSession: Send + 'static {
    /// Whether the session is still believed usable.
    fn is_open(&self) -> bool;

    /// Whether a transaction is open on the session.
    fn in_transaction(&self) -> bool;

    /// Marks the session unusable after a command was abandoned mid-flight.
    ///
    /// A broken session is never returned to a pool.
    fn mark_broken(&mut self);

    /// Runs a trivial query to keep the connection from idling out.
    fn keepalive_probe(&mut self) -> impl Future<Output = LockResult<()>> + Send;

    fn begin_transaction(&mut self) -> impl Future<Output = LockResult<()>> + Send;

    fn rollback_transaction(&mut self) -> impl Future<Output = LockResult<()>> + Send;

    /// Closes the session. Any session-scoped locks are released server-side.
    fn close(&mut self) -> impl Future<Output = LockResult<()>> + Send;

    /// Timer used for client-side bounded waits.
    fn sleep(duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}
