//! Connection sources and options for PostgreSQL locks.

use std::sync::Arc;
use std::time::Duration;

use advisory_lock_core::data::{
    AcquisitionEngine, ConnectionSource, EngineOptions, MultiplexedConnectionPool,
};
use advisory_lock_core::error::{LockError, LockResult};
use advisory_lock_core::executor::runtime_handle;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::backend::PostgresAdvisoryLock;
use crate::session::ExternalConnection;

/// PostgreSQL connection source.
#[derive(Debug, Clone)]
pub enum PostgresConnection {
    /// Connection string - library manages pooling.
    ConnectionString(String),
    /// External connection pool.
    Pool(PgPool),
}

impl PostgresConnection {
    /// Creates a lazily-connecting pool from a connection string.
    ///
    /// The string is validated here; no connection is opened until a lock
    /// is first acquired. Works from synchronous code too, in which case the
    /// pool lives on the shared blocking runtime.
    pub fn create_pool(connection_string: &str) -> LockResult<PgPool> {
        if connection_string.trim().is_empty() {
            return Err(LockError::InvalidArgument(
                "connection string must not be empty".to_string(),
            ));
        }
        let runtime = runtime_handle()?;
        let _entered = runtime.enter();
        PgPoolOptions::new()
            .connect_lazy(connection_string)
            .map_err(|e| LockError::InvalidArgument(format!("invalid connection string: {}", e)))
    }

    /// Gets or creates a connection pool.
    pub fn get_pool(&self) -> LockResult<PgPool> {
        match self {
            Self::ConnectionString(conn_str) => Self::create_pool(conn_str),
            Self::Pool(pool) => Ok(pool.clone()),
        }
    }
}

/// A connection pool plus the connections that multiplexed locks share.
///
/// Locks built from the same `PostgresLockPool` (or its clones) run their
/// non-blocking attempts on a common set of connections, so holding many
/// locks on distinct keys needs only a few connections.
#[derive(Clone)]
pub struct PostgresLockPool {
    backend: Arc<PostgresAdvisoryLock>,
    multiplexer: Arc<MultiplexedConnectionPool<PostgresAdvisoryLock>>,
}

impl PostgresLockPool {
    pub fn new(pool: PgPool) -> Self {
        let backend = Arc::new(PostgresAdvisoryLock::new(pool));
        let multiplexer = Arc::new(MultiplexedConnectionPool::new(Arc::clone(&backend)));
        Self {
            backend,
            multiplexer,
        }
    }

    /// Creates a lazily-connecting pool for `connection_string`.
    pub fn connect(connection_string: &str) -> LockResult<Self> {
        Ok(Self::new(PostgresConnection::create_pool(connection_string)?))
    }

    pub fn pool(&self) -> &PgPool {
        self.backend.pool()
    }

    /// Number of shared connections currently open.
    pub fn multiplexed_connection_count(&self) -> usize {
        self.multiplexer.connection_count()
    }

    pub(crate) fn engine(&self, options: EngineOptions) -> AcquisitionEngine<PostgresAdvisoryLock> {
        AcquisitionEngine::new(Arc::clone(&self.backend), ConnectionSource::Owned, options)
            .with_multiplexer(Arc::clone(&self.multiplexer))
    }
}

impl From<PgPool> for PostgresLockPool {
    fn from(pool: PgPool) -> Self {
        Self::new(pool)
    }
}

impl std::fmt::Debug for PostgresLockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLockPool")
            .field("multiplexer", &self.multiplexer)
            .finish()
    }
}

/// Options for locks that manage their own connections.
///
/// Multiplexing is on by default: non-blocking acquisitions share a small
/// set of connections and only waits get a connection of their own. Sharing
/// happens between locks built from one [`PostgresLockPool`] or one
/// provider; a lock with a pool of its own always uses a dedicated
/// connection. Multiplexing cannot be combined with
/// [`use_transaction`](Self::use_transaction).
#[derive(Debug, Clone, Default)]
pub struct PostgresConnectionOptions {
    use_multiplexing: Option<bool>,
    use_transaction: bool,
    keepalive_cadence: Option<Duration>,
}

impl PostgresConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_multiplexing(mut self, use_multiplexing: bool) -> Self {
        self.use_multiplexing = Some(use_multiplexing);
        self
    }

    /// Takes transaction-scoped locks inside a transaction owned by the
    /// lock, rather than session-scoped locks.
    pub fn use_transaction(mut self, use_transaction: bool) -> Self {
        self.use_transaction = use_transaction;
        self
    }

    /// Runs a trivial query this often while a lock is held, so idle-
    /// connection reapers leave the connection alone.
    pub fn keepalive_cadence(mut self, cadence: Duration) -> Self {
        self.keepalive_cadence = Some(cadence);
        self
    }

    pub(crate) fn engine_options(&self) -> LockResult<EngineOptions> {
        if self.use_transaction && self.use_multiplexing == Some(true) {
            return Err(LockError::InvalidArgument(
                "use_transaction is not compatible with use_multiplexing".to_string(),
            ));
        }
        Ok(EngineOptions {
            transaction_scoped: self.use_transaction,
            keepalive_cadence: self.keepalive_cadence,
            multiplexing: self.use_multiplexing.unwrap_or(!self.use_transaction),
        })
    }
}

/// Engine for a lock that opens its own connections from `pool`, with
/// nobody to share them with.
pub(crate) fn pooled_engine(
    pool: PgPool,
    options: &PostgresConnectionOptions,
) -> LockResult<AcquisitionEngine<PostgresAdvisoryLock>> {
    let options = options.engine_options()?;
    Ok(AcquisitionEngine::new(
        Arc::new(PostgresAdvisoryLock::new(pool)),
        ConnectionSource::Owned,
        options,
    ))
}

/// Engine for a lock that shares `pool`'s multiplexed connections.
pub(crate) fn shared_engine(
    pool: &PostgresLockPool,
    options: &PostgresConnectionOptions,
) -> LockResult<AcquisitionEngine<PostgresAdvisoryLock>> {
    Ok(pool.engine(options.engine_options()?))
}

/// Engine for a lock taken on the caller's connection.
pub(crate) fn external_engine(
    connection: &ExternalConnection,
    transaction_scoped: bool,
) -> AcquisitionEngine<PostgresAdvisoryLock> {
    let pool = connection.pool();
    AcquisitionEngine::new(
        Arc::new(PostgresAdvisoryLock::new(pool)),
        ConnectionSource::External(connection.session()),
        EngineOptions {
            transaction_scoped,
            ..EngineOptions::default()
        },
    )
}
