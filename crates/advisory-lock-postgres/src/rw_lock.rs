//! PostgreSQL reader-writer lock implementation.

use std::time::Duration;

use advisory_lock_core::cancellation::CancellationToken;
use advisory_lock_core::data::AcquisitionEngine;
use advisory_lock_core::error::LockResult;
use advisory_lock_core::timeout::TimeoutValue;
use advisory_lock_core::traits::{DistributedReaderWriterLock, LockMode};
use sqlx::PgPool;
use tracing::instrument;

use crate::backend::PostgresAdvisoryLock;
use crate::connection::{
    external_engine, pooled_engine, shared_engine, PostgresConnection, PostgresConnectionOptions,
    PostgresLockPool,
};
use crate::handle::{PostgresLockHandle, PostgresReadLockHandle, PostgresWriteLockHandle};
use crate::key::PostgresAdvisoryLockKey;
use crate::session::ExternalConnection;

/// A reader-writer lock on a PostgreSQL advisory lock key.
///
/// Readers take the key in shared mode and writers in exclusive mode, so
/// any number of readers or a single writer may hold it at once.
pub struct PostgresDistributedReaderWriterLock {
    key: PostgresAdvisoryLockKey,
    name: String,
    engine: AcquisitionEngine<PostgresAdvisoryLock>,
}

impl PostgresDistributedReaderWriterLock {
    pub fn new(
        key: PostgresAdvisoryLockKey,
        connection_string: &str,
        options: PostgresConnectionOptions,
    ) -> LockResult<Self> {
        let pool = PostgresConnection::ConnectionString(connection_string.to_string()).get_pool()?;
        Self::with_pool(key, pool, options)
    }

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

    async fn try_acquire_mode(
        &self,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<PostgresLockHandle>> {
        let handle = self
            .engine
            .try_acquire(self.key, mode, TimeoutValue::from(timeout), cancel)
            .await?;
        Ok(handle.map(PostgresLockHandle::new))
    }
}

impl DistributedReaderWriterLock for PostgresDistributedReaderWriterLock {
    type ReadHandle = PostgresReadLockHandle;
    type WriteHandle = PostgresWriteLockHandle;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, cancel), fields(lock.name = %self.name, timeout = ?timeout, backend = "postgres", lock_type = "read"))]
    async fn try_acquire_read_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<Self::ReadHandle>> {
        self.try_acquire_mode(LockMode::Shared, timeout, cancel).await
    }

    #[instrument(skip(self, cancel), fields(lock.name = %self.name, timeout = ?timeout, backend = "postgres", lock_type = "write"))]
    async fn try_acquire_write_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<Self::WriteHandle>> {
        self.try_acquire_mode(LockMode::Exclusive, timeout, cancel).await
    }
}

impl std::fmt::Debug for PostgresDistributedReaderWriterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDistributedReaderWriterLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("engine", &self.engine)
            .finish()
    }
}
