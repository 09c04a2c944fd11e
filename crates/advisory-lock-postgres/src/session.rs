//! Postgres sessions: the physical connections locks are taken on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use advisory_lock_core::data::DatabaseSession;
use advisory_lock_core::error::{LockError, LockResult};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres, Row};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// SQLSTATE raised when `lock_timeout` expires.
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE raised by `pg_cancel_backend` and `statement_timeout`.
pub(crate) const QUERY_CANCELED: &str = "57014";
/// SQLSTATE raised when the server's deadlock detector fires.
pub(crate) const DEADLOCK_DETECTED: &str = "40P01";

/// The SQLSTATE of a database error, if `error` is one.
pub(crate) fn sqlstate(error: &sqlx::Error) -> Option<String> {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// Classifies a driver error.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> LockError {
    match sqlstate(&error).as_deref() {
        Some(QUERY_CANCELED) => return LockError::Cancelled,
        Some(DEADLOCK_DETECTED) => return LockError::Deadlock(error.to_string()),
        _ => {}
    }
    if is_connection_fault(&error) {
        LockError::connection(error)
    } else {
        LockError::backend(error)
    }
}

/// Whether `error` leaves the connection unusable.
fn is_connection_fault(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// One pooled Postgres connection.
///
/// Closing a healthy session releases its session-scoped advisory locks and
/// returns the connection to the pool. A broken session, or one dropped
/// without being closed, is detached from the pool and shut down so the
/// server frees whatever it still held.
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
    broken: bool,
}

impl PgSession {
    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        Self {
            conn: None,
            in_transaction: false,
            broken: false,
        }
    }

    pub(crate) async fn open(pool: &PgPool) -> LockResult<Self> {
        let conn = pool.acquire().await.map_err(map_sqlx_error)?;
        Ok(Self {
            conn: Some(conn),
            in_transaction: false,
            broken: false,
        })
    }

    /// The underlying connection, for running the caller's own queries.
    ///
    /// Transactions should be managed through
    /// [`DatabaseSession::begin_transaction`] and friends so the lock layer
    /// sees them.
    pub fn connection(&mut self) -> LockResult<&mut PgConnection> {
        if self.broken {
            return Err(LockError::InvalidOperation(
                "the session is broken".to_string(),
            ));
        }
        self.conn
            .as_deref_mut()
            .ok_or_else(|| LockError::InvalidOperation("the session has been closed".to_string()))
    }

    fn fail(&mut self, error: sqlx::Error) -> LockError {
        let error = map_sqlx_error(error);
        if matches!(error, LockError::Connection(_)) {
            self.broken = true;
        }
        error
    }

    /// Runs one or more statements, discarding their results.
    pub async fn execute(&mut self, sql: &str) -> LockResult<()> {
        match self.execute_raw(sql).await? {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Like [`execute`](Self::execute), but hands back the raw driver error
    /// so callers can inspect its SQLSTATE.
    ///
    /// Statements go through the simple query protocol, so `sql` may hold
    /// several of them. The future is boxed to keep it `Send` for any borrow
    /// of the connection.
    pub(crate) fn execute_raw<'a>(
        &'a mut self,
        sql: &'a str,
    ) -> Pin<Box<dyn Future<Output = LockResult<Result<(), sqlx::Error>>> + Send + 'a>> {
        Box::pin(async move {
            let result = Executor::execute(self.connection()?, sql).await;
            Ok(match result {
                Ok(_) => Ok(()),
                Err(e) => {
                    if is_connection_fault(&e) {
                        self.broken = true;
                    }
                    Err(e)
                }
            })
        })
    }

    async fn fetch_row(&mut self, sql: &str) -> LockResult<PgRow> {
        let result = sqlx::query(sql).fetch_one(self.connection()?).await;
        result.map_err(|e| self.fail(e))
    }

    pub(crate) async fn fetch_bool(&mut self, sql: &str) -> LockResult<bool> {
        let row = self.fetch_row(sql).await?;
        row.try_get::<bool, _>(0).map_err(LockError::backend)
    }

    pub(crate) async fn fetch_i32(&mut self, sql: &str) -> LockResult<i32> {
        let row = self.fetch_row(sql).await?;
        row.try_get::<i32, _>(0).map_err(LockError::backend)
    }

    /// Reads a server setting with `SHOW`.
    pub async fn show_setting(&mut self, name: &str) -> LockResult<String> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.') {
            return Err(LockError::InvalidArgument(format!(
                "'{}' is not a setting name",
                name
            )));
        }
        let row = self.fetch_row(&format!("SHOW {}", name)).await?;
        row.try_get::<String, _>(0).map_err(LockError::backend)
    }

    /// Commits the open transaction.
    pub async fn commit_transaction(&mut self) -> LockResult<()> {
        if !self.in_transaction {
            return Err(LockError::InvalidOperation(
                "no transaction is open on the session".to_string(),
            ));
        }
        let result = self.execute("COMMIT").await;
        self.in_transaction = false;
        result
    }

    async fn shut_down(&mut self) -> LockResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.detach().close().await.map_err(map_sqlx_error)
    }
}

impl DatabaseSession for PgSession {
    fn is_open(&self) -> bool {
        self.conn.is_some() && !self.broken
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    async fn keepalive_probe(&mut self) -> LockResult<()> {
        self.execute("SELECT 1").await
    }

    async fn begin_transaction(&mut self) -> LockResult<()> {
        if self.in_transaction {
            return Err(LockError::InvalidOperation(
                "a transaction is already open on the session".to_string(),
            ));
        }
        self.execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> LockResult<()> {
        let result = self.execute("ROLLBACK").await;
        self.in_transaction = false;
        result
    }

    async fn close(&mut self) -> LockResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        if !self.broken {
            if self.in_transaction {
                if let Err(e) = self.rollback_transaction().await {
                    debug!("rollback before close failed: {}", e);
                    self.broken = true;
                }
            }
            if !self.broken {
                match self.execute("SELECT pg_advisory_unlock_all()").await {
                    Ok(()) => {
                        // Back to the pool with no locks left behind.
                        self.conn = None;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("failed to clear advisory locks before pooling: {}", e);
                        self.broken = true;
                    }
                }
            }
        }
        self.shut_down().await
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Never pool a connection that may still hold locks.
            drop(conn.detach());
        }
    }
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("open", &self.is_open())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

/// A connection owned by the caller that locks can be taken on.
///
/// Locks created with `with_connection` run on this connection instead of
/// opening their own. If a transaction is open when a lock is acquired, the
/// acquisition happens inside it and leaves the transaction's settings as
/// they were.
#[derive(Clone)]
pub struct ExternalConnection {
    session: Arc<Mutex<PgSession>>,
    pool: PgPool,
}

impl ExternalConnection {
    /// Checks a connection out of `pool`.
    pub async fn acquire(pool: &PgPool) -> LockResult<Self> {
        let session = PgSession::open(pool).await?;
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            pool: pool.clone(),
        })
    }

    /// Checks a connection out of `pool` and begins a transaction on it.
    pub async fn begin(pool: &PgPool) -> LockResult<Self> {
        let connection = Self::acquire(pool).await?;
        connection.begin_transaction().await?;
        Ok(connection)
    }

    /// Exclusive access to the session for running queries.
    pub async fn lock(&self) -> MutexGuard<'_, PgSession> {
        self.session.lock().await
    }

    pub async fn begin_transaction(&self) -> LockResult<()> {
        self.session.lock().await.begin_transaction().await
    }

    pub async fn commit(&self) -> LockResult<()> {
        self.session.lock().await.commit_transaction().await
    }

    pub async fn rollback(&self) -> LockResult<()> {
        self.session.lock().await.rollback_transaction().await
    }

    pub async fn in_transaction(&self) -> bool {
        self.session.lock().await.in_transaction()
    }

    pub async fn show_setting(&self, name: &str) -> LockResult<String> {
        self.session.lock().await.show_setting(name).await
    }

    /// Releases every lock still held on the connection and returns it to
    /// the pool.
    pub async fn close(&self) -> LockResult<()> {
        self.session.lock().await.close().await
    }

    pub(crate) fn session(&self) -> Arc<Mutex<PgSession>> {
        Arc::clone(&self.session)
    }

    /// The pool the connection came from; side-channel cancels connect
    /// with its options.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

impl std::fmt::Debug for ExternalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConnection").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            LockError::Connection(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolClosed),
            LockError::Connection(_)
        ));
    }

    #[test]
    fn test_io_errors_are_connection_errors() {
        let error = sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(map_sqlx_error(error), LockError::Connection(_)));
    }

    #[test]
    fn test_other_errors_are_backend_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            LockError::Backend(_)
        ));
        assert_eq!(sqlstate(&sqlx::Error::RowNotFound), None);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_session_commands_are_send() {
        let mut session = PgSession::closed();
        {
            let probe = session.keepalive_probe();
            assert_send(&probe);
        }
        {
            let begin = session.begin_transaction();
            assert_send(&begin);
        }
        {
            let rollback = session.rollback_transaction();
            assert_send(&rollback);
        }

        // A closed session refuses commands instead of panicking.
        assert!(matches!(
            session.keepalive_probe().await,
            Err(LockError::InvalidOperation(_))
        ));
    }
}
