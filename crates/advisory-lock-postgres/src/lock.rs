//! PostgreSQL distributed lock implementation.

use std::time::Duration;

use advisory_lock_core::cancellation::CancellationToken;
use advisory_lock_core::data::AcquisitionEngine;
use advisory_lock_core::error::{LockError, LockResult};
use advisory_lock_core::timeout::TimeoutValue;
use advisory_lock_core::traits::{DistributedLock, LockMode};
use sqlx::PgPool;
use tracing::instrument;

use crate::backend::PostgresAdvisoryLock;
use crate::connection::{
    external_engine, pooled_engine, shared_engine, PostgresConnection, PostgresConnectionOptions,
    PostgresLockPool,
};
use crate::handle::PostgresLockHandle;
use crate::key::PostgresAdvisoryLockKey;
use crate::session::ExternalConnection;

/// An exclusive lock on a PostgreSQL advisory lock key.
pub struct PostgresDistributedLock {
    /// The lock key.
    key: PostgresAdvisoryLockKey,
    /// Lock name as reported by [`DistributedLock::name`].
    name: String,
    engine: AcquisitionEngine<PostgresAdvisoryLock>,
}

impl PostgresDistributedLock {
    /// Creates a lock that opens its own connections to `connection_string`.
    pub fn new(
        key: PostgresAdvisoryLockKey,
        connection_string: &str,
        options: PostgresConnectionOptions,
    ) -> LockResult<Self> {
        let pool = PostgresConnection::ConnectionString(connection_string.to_string()).get_pool()?;
        Self::with_pool(key, pool, options)
    }

    /// Creates a lock that opens its own connections from `pool`.
    ///
    /// The lock shares no connections with other locks; use
    /// [`with_lock_pool`](Self::with_lock_pool) for that.
    pub fn with_pool(
        key: PostgresAdvisoryLockKey,
        pool: PgPool,
        options: PostgresConnectionOptions,
    ) -> LockResult<Self> {
        Ok(Self::from_engine(key.to_string(), key, pooled_engine(pool, &options)?))
    }

    /// Creates a lock whose non-blocking attempts share connections with
    /// every other lock built from `pool`.
    pub fn with_lock_pool(
        key: PostgresAdvisoryLockKey,
        pool: &PostgresLockPool,
        options: PostgresConnectionOptions,
    ) -> LockResult<Self> {
        Ok(Self::from_engine(key.to_string(), key, shared_engine(pool, &options)?))
    }

    /// Creates a lock that is taken on the caller's connection.
    ///
    /// Locks are session-scoped, so they outlive a transaction open on the
    /// connection at acquisition time. The connection must stay open while
    /// the lock is held.
    pub fn with_connection(key: PostgresAdvisoryLockKey, connection: &ExternalConnection) -> Self {
        Self::from_engine(key.to_string(), key, external_engine(connection, false))
    }

    pub(crate) fn from_engine(
        name: String,
        key: PostgresAdvisoryLockKey,
        engine: AcquisitionEngine<PostgresAdvisoryLock>,
    ) -> Self {
        Self { key, name, engine }
    }

    pub fn key(&self) -> PostgresAdvisoryLockKey {
        self.key
    }

    /// Takes a transaction-scoped lock inside the transaction open on
    /// `transaction`.
    ///
    /// There is no handle: the lock is held until the transaction commits
    /// or rolls back. Returns `false` if `timeout` elapsed first.
    #[instrument(skip(transaction, cancel), fields(lock.key = %key, timeout = ?timeout, backend = "postgres"))]
    pub async fn try_acquire_with_transaction(
        key: PostgresAdvisoryLockKey,
        transaction: &ExternalConnection,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<bool> {
        let engine = external_engine(transaction, true);
        match engine
            .try_acquire(key, LockMode::Exclusive, TimeoutValue::from(timeout), cancel)
            .await?
        {
            Some(mut handle) => {
                // Detaches from the connection; the transaction keeps the lock.
                handle.close().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`try_acquire_with_transaction`](Self::try_acquire_with_transaction),
    /// but fails with [`LockError::Timeout`] instead of returning `false`.
    pub async fn acquire_with_transaction(
        key: PostgresAdvisoryLockKey,
        transaction: &ExternalConnection,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<()> {
        if Self::try_acquire_with_transaction(key, transaction, timeout, cancel).await? {
            Ok(())
        } else {
            Err(LockError::Timeout(TimeoutValue::from(timeout).elapsed_budget()))
        }
    }
}

impl DistributedLock for PostgresDistributedLock {
    type Handle = PostgresLockHandle;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, cancel), fields(lock.name = %self.name, timeout = ?timeout, backend = "postgres"))]
    async fn try_acquire_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<Self::Handle>> {
        let handle = self
            .engine
            .try_acquire(self.key, LockMode::Exclusive, TimeoutValue::from(timeout), cancel)
            .await?;
        Ok(handle.map(PostgresLockHandle::new))
    }
}

impl std::fmt::Debug for PostgresDistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDistributedLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("engine", &self.engine)
            .finish()
    }
}
