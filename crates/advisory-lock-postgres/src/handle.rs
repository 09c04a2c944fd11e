//! PostgreSQL lock handle implementation.

use advisory_lock_core::data::DbLockHandle;
use advisory_lock_core::error::LockResult;
use advisory_lock_core::traits::{LockHandle, LockMode};
use tokio::sync::watch;

use crate::backend::PostgresAdvisoryLock;
use crate::key::PostgresAdvisoryLockKey;

/// Handle for a held PostgreSQL lock.
///
/// Dropping the handle without releasing it schedules the release in the
/// background; call [`LockHandle::release`] to wait for it.
#[derive(Debug)]
pub struct PostgresLockHandle {
    inner: DbLockHandle<PostgresAdvisoryLock>,
}

/// Handle for a held read lock.
pub type PostgresReadLockHandle = PostgresLockHandle;
/// Handle for a held write lock.
pub type PostgresWriteLockHandle = PostgresLockHandle;

impl PostgresLockHandle {
    pub(crate) fn new(inner: DbLockHandle<PostgresAdvisoryLock>) -> Self {
        Self { inner }
    }

    /// The key held, or `None` once released.
    pub fn key(&self) -> Option<PostgresAdvisoryLockKey> {
        self.inner.key().copied()
    }

    pub fn mode(&self) -> LockMode {
        self.inner.mode()
    }

    /// Whether the lock shares its connection with other locks.
    pub fn is_multiplexed(&self) -> bool {
        self.inner.is_multiplexed()
    }

    /// Releases the lock if still held. Safe to call more than once.
    pub async fn close(&mut self) {
        self.inner.close().await;
    }
}

impl LockHandle for PostgresLockHandle {
    fn lost_token(&self) -> &watch::Receiver<bool> {
        self.inner.lost_token()
    }

    async fn release(self) -> LockResult<()> {
        self.inner.release().await
    }
}
