//! PostgreSQL lock provider implementation.

use std::time::Duration;

use advisory_lock_core::data::{AcquisitionEngine, EngineOptions};
use advisory_lock_core::error::{LockError, LockResult};
use advisory_lock_core::traits::{LockProvider, ReaderWriterLockProvider};
use sqlx::PgPool;

use crate::backend::PostgresAdvisoryLock;
use crate::connection::{PostgresConnection, PostgresConnectionOptions, PostgresLockPool};
use crate::key::PostgresAdvisoryLockKey;
use crate::lock::PostgresDistributedLock;
use crate::rw_lock::PostgresDistributedReaderWriterLock;

/// Builder for PostgreSQL lock provider configuration.
pub struct PostgresLockProviderBuilder {
    connection: Option<PostgresConnection>,
    options: PostgresConnectionOptions,
}

impl PostgresLockProviderBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            connection: None,
            options: PostgresConnectionOptions::new(),
        }
    }

    /// Sets the PostgreSQL connection string.
    pub fn connection_string(mut self, conn_str: impl Into<String>) -> Self {
        self.connection = Some(PostgresConnection::ConnectionString(conn_str.into()));
        self
    }

    /// Sets an existing connection pool.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.connection = Some(PostgresConnection::Pool(pool));
        self
    }

    /// Sets whether to use transaction-scoped locks.
    pub fn use_transaction(mut self, use_transaction: bool) -> Self {
        self.options = self.options.use_transaction(use_transaction);
        self
    }

    /// Sets whether non-blocking acquisitions share connections.
    pub fn use_multiplexing(mut self, use_multiplexing: bool) -> Self {
        self.options = self.options.use_multiplexing(use_multiplexing);
        self
    }

    /// Sets the keepalive cadence for long-held locks.
    pub fn keepalive_cadence(mut self, cadence: Duration) -> Self {
        self.options = self.options.keepalive_cadence(cadence);
        self
    }

    /// Builds the provider.
    pub async fn build(self) -> LockResult<PostgresLockProvider> {
        let connection = self
            .connection
            .ok_or_else(|| LockError::InvalidArgument("connection not specified".to_string()))?;

        let options = self.options.engine_options()?;
        Ok(PostgresLockProvider {
            pool: PostgresLockPool::new(connection.get_pool()?),
            options,
        })
    }
}

impl Default for PostgresLockProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider for PostgreSQL-based distributed locks.
///
/// All locks created by one provider share its pool and, when multiplexing
/// is enabled, its set of shared connections.
pub struct PostgresLockProvider {
    pool: PostgresLockPool,
    options: EngineOptions,
}

impl PostgresLockProvider {
    /// Returns a new builder for configuring the provider.
    pub fn builder() -> PostgresLockProviderBuilder {
        PostgresLockProviderBuilder::new()
    }

    /// Creates a provider using the specified connection string.
    pub async fn new(connection_string: impl Into<String>) -> LockResult<Self> {
        Self::builder()
            .connection_string(connection_string)
            .build()
            .await
    }

    pub fn pool(&self) -> &PgPool {
        self.pool.pool()
    }

    /// The shared pool, for building locks directly that share connections
    /// with this provider's locks.
    pub fn lock_pool(&self) -> &PostgresLockPool {
        &self.pool
    }

    /// Number of shared connections currently open.
    pub fn multiplexed_connection_count(&self) -> usize {
        self.pool.multiplexed_connection_count()
    }

    fn engine(&self) -> AcquisitionEngine<PostgresAdvisoryLock> {
        self.pool.engine(self.options)
    }
}

impl LockProvider for PostgresLockProvider {
    type Lock = PostgresDistributedLock;

    fn create_lock(&self, name: &str) -> Self::Lock {
        let key = PostgresAdvisoryLockKey::from_name_hashed(name);
        PostgresDistributedLock::from_engine(name.to_string(), key, self.engine())
    }
}

impl ReaderWriterLockProvider for PostgresLockProvider {
    type Lock = PostgresDistributedReaderWriterLock;

    fn create_reader_writer_lock(&self, name: &str) -> Self::Lock {
        let key = PostgresAdvisoryLockKey::from_name_hashed(name);
        PostgresDistributedReaderWriterLock::from_engine(name.to_string(), key, self.engine())
    }
}
