//! Advisory lock commands.

use advisory_lock_core::data::{AcquireRequest, DatabaseSession, LockBackend};
use advisory_lock_core::error::{LockError, LockResult};
use advisory_lock_core::timeout::TimeoutValue;
use advisory_lock_core::traits::LockMode;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, warn};

use crate::key::PostgresAdvisoryLockKey;
use crate::session::{map_sqlx_error, sqlstate, PgSession, LOCK_NOT_AVAILABLE};

const SAVEPOINT: &str = "advisory_lock_wait";

/// Issues `pg_*advisory*` commands on sessions from one pool.
///
/// Waits are bounded server-side with `lock_timeout` and interrupted with
/// `pg_cancel_backend` from a separate connection.
#[derive(Debug, Clone)]
pub struct PostgresAdvisoryLock {
    pool: PgPool,
}

impl PostgresAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fails with [`LockError::Deadlock`] if `session` already holds `key`.
    ///
    /// Advisory locks are re-entrant per session, so a caller-owned
    /// connection asking for a lock it holds would otherwise "succeed"
    /// without any exclusion.
    async fn ensure_not_held(
        &self,
        session: &mut PgSession,
        key: &PostgresAdvisoryLockKey,
    ) -> LockResult<()> {
        if session.fetch_bool(&held_by_session_sql(key)).await? {
            return Err(LockError::Deadlock(format!(
                "attempted to acquire lock {} on a connection that already holds it",
                key
            )));
        }
        Ok(())
    }

    async fn wait_for_lock(
        &self,
        session: &mut PgSession,
        request: &AcquireRequest<PostgresAdvisoryLockKey>,
        timeout: TimeoutValue,
    ) -> LockResult<bool> {
        let scope = if request.in_transaction {
            WaitScope::Savepoint
        } else {
            WaitScope::Transaction
        };

        // Settings of the caller's transaction that must survive a
        // transaction-scoped acquisition, which cannot be rolled back.
        let restore = if scope == WaitScope::Savepoint && request.transaction_scoped {
            Some((
                session.show_setting("statement_timeout").await?,
                session.show_setting("lock_timeout").await?,
            ))
        } else {
            None
        };

        if let Err(e) = session.execute(&wait_setup_sql(scope, timeout)).await {
            abandon_wait(session, scope).await;
            return Err(e);
        }
        let outcome = session
            .execute_raw(&acquire_sql(request, false))
            .await?;

        let acquired = match outcome {
            Ok(()) => true,
            Err(e) if sqlstate(&e).as_deref() == Some(LOCK_NOT_AVAILABLE) => false,
            Err(e) => {
                abandon_wait(session, scope).await;
                return Err(map_sqlx_error(e));
            }
        };

        let cleanup = match (&restore, acquired) {
            (Some((statement_timeout, lock_timeout)), true) => {
                restore_settings_sql(statement_timeout, lock_timeout)
            }
            _ => wait_abort_sql(scope).to_string(),
        };
        finish_wait(session, &cleanup).await?;
        Ok(acquired)
    }
}

/// Runs the post-wait cleanup. A cancel request that lands after the lock
/// command finished interrupts the cleanup instead; it is consumed by then,
/// so one retry suffices.
async fn finish_wait(session: &mut PgSession, sql: &str) -> LockResult<()> {
    match session.execute(sql).await {
        Err(LockError::Cancelled) => session.execute(sql).await,
        other => other,
    }
}

async fn abandon_wait(session: &mut PgSession, scope: WaitScope) {
    if let Err(e) = finish_wait(session, wait_abort_sql(scope)).await {
        debug!("cleanup after failed acquire also failed: {}", e);
        session.mark_broken();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitScope {
    /// A throwaway transaction around the wait; session locks survive it.
    Transaction,
    /// A savepoint inside the transaction that is already open.
    Savepoint,
}

fn function_name(mode: LockMode, is_try: bool, transaction_scoped: bool) -> String {
    format!(
        "pg_{}advisory_{}lock{}",
        if is_try { "try_" } else { "" },
        if transaction_scoped { "xact_" } else { "" },
        match mode {
            LockMode::Exclusive => "",
            LockMode::Shared => "_shared",
        }
    )
}

fn acquire_sql(request: &AcquireRequest<PostgresAdvisoryLockKey>, is_try: bool) -> String {
    format!(
        "SELECT pg_catalog.{}({})",
        function_name(request.mode, is_try, request.transaction_scoped),
        request.key.sql_args()
    )
}

fn release_sql(key: &PostgresAdvisoryLockKey, mode: LockMode) -> String {
    let suffix = match mode {
        LockMode::Exclusive => "",
        LockMode::Shared => "_shared",
    };
    format!(
        "SELECT pg_catalog.pg_advisory_unlock{}({})",
        suffix,
        key.sql_args()
    )
}

fn held_by_session_sql(key: &PostgresAdvisoryLockKey) -> String {
    let (classid, objid, objsubid) = key.lock_table_ids();
    format!(
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_locks l \
         JOIN pg_catalog.pg_database d ON d.oid = l.database \
         WHERE l.locktype = 'advisory' \
         AND d.datname = pg_catalog.current_database() \
         AND l.pid = pg_catalog.pg_backend_pid() \
         AND l.granted \
         AND l.classid = '{}'::oid AND l.objid = '{}'::oid AND l.objsubid = {})",
        classid, objid, objsubid
    )
}

/// Longest `lock_timeout` the server accepts, in milliseconds.
const MAX_LOCK_TIMEOUT_MILLIS: i64 = i32::MAX as i64;

/// Whether `timeout` can be expressed as a `lock_timeout`.
fn fits_lock_timeout(timeout: TimeoutValue) -> bool {
    timeout
        .as_millis()
        .map_or(true, |millis| millis <= MAX_LOCK_TIMEOUT_MILLIS)
}

/// `lock_timeout` in milliseconds; 0 disables it. Timeouts too long for the
/// server also disable it and are left to the caller's timer.
fn lock_timeout_millis(timeout: TimeoutValue) -> i64 {
    match timeout.as_millis() {
        Some(millis) if millis <= MAX_LOCK_TIMEOUT_MILLIS => millis.max(1),
        _ => 0,
    }
}

fn wait_setup_sql(scope: WaitScope, timeout: TimeoutValue) -> String {
    let open = match scope {
        WaitScope::Transaction => "BEGIN".to_string(),
        WaitScope::Savepoint => format!("SAVEPOINT {}", SAVEPOINT),
    };
    format!(
        "{}; SET LOCAL statement_timeout = 0; SET LOCAL lock_timeout = {}",
        open,
        lock_timeout_millis(timeout)
    )
}

fn wait_abort_sql(scope: WaitScope) -> &'static str {
    match scope {
        WaitScope::Transaction => "ROLLBACK",
        WaitScope::Savepoint => "ROLLBACK TO SAVEPOINT advisory_lock_wait; RELEASE SAVEPOINT advisory_lock_wait",
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn restore_settings_sql(statement_timeout: &str, lock_timeout: &str) -> String {
    format!(
        "RELEASE SAVEPOINT {}; SET LOCAL statement_timeout = {}; SET LOCAL lock_timeout = {}",
        SAVEPOINT,
        quote_literal(statement_timeout),
        quote_literal(lock_timeout)
    )
}

impl LockBackend for PostgresAdvisoryLock {
    type Session = PgSession;
    type Key = PostgresAdvisoryLockKey;
    type SessionId = i32;

    fn open_session(
        &self,
    ) -> impl std::future::Future<Output = LockResult<PgSession>> + Send + 'static {
        let pool = self.pool.clone();
        async move { PgSession::open(&pool).await }
    }

    async fn session_id(&self, session: &mut PgSession) -> LockResult<i32> {
        session.fetch_i32("SELECT pg_catalog.pg_backend_pid()").await
    }

    async fn cancel_session(&self, pid: &i32) -> LockResult<()> {
        let options = self.pool.connect_options();
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(map_sqlx_error)?;
        let result = sqlx::query("SELECT pg_catalog.pg_cancel_backend($1)")
            .bind(*pid)
            .execute(&mut conn)
            .await
            .map_err(map_sqlx_error);
        if let Err(e) = conn.close().await {
            debug!("failed to close side-channel connection: {}", e);
        }
        result.map(|_| ())
    }

    fn has_native_timeout(&self, timeout: TimeoutValue) -> bool {
        fits_lock_timeout(timeout)
    }

    async fn try_acquire(
        &self,
        session: &mut PgSession,
        request: &AcquireRequest<PostgresAdvisoryLockKey>,
    ) -> LockResult<bool> {
        if request.externally_owned {
            self.ensure_not_held(session, &request.key).await?;
        }
        session.fetch_bool(&acquire_sql(request, true)).await
    }

    async fn blocking_acquire(
        &self,
        session: &mut PgSession,
        request: &AcquireRequest<PostgresAdvisoryLockKey>,
        timeout: TimeoutValue,
    ) -> LockResult<bool> {
        if request.externally_owned {
            self.ensure_not_held(session, &request.key).await?;
        }
        self.wait_for_lock(session, request, timeout).await
    }

    async fn release(
        &self,
        session: &mut PgSession,
        key: &PostgresAdvisoryLockKey,
        mode: LockMode,
    ) -> LockResult<()> {
        if !session.fetch_bool(&release_sql(key, mode)).await? {
            warn!("lock {} was not held by its session at release", key);
        }
        Ok(())
    }
}
