//! Uniform lifecycle wrapper over one database session.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::monitor::ConnectionMonitor;
use super::session::DatabaseSession;
use crate::cancellation::CancellationToken;
use crate::error::{LockError, LockResult};

/// Whether closing the connection also closes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Opened for a single acquisition; closed with it.
    Owned,
    /// Supplied by the caller, who keeps control of its lifetime.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    None,
    /// Begun by this connection; rolled back when disposed.
    Owned,
    /// The caller's transaction; never ended here.
    External,
}

struct ConnectionState {
    transaction: TransactionState,
    closed: bool,
}

/// A session plus its monitor and transaction state.
///
/// All commands go through [`lock_session`](Self::lock_session), so only one
/// of {command, keepalive probe, transaction change} touches the session at a
/// time.
pub struct DatabaseConnection<S: DatabaseSession> {
    monitor: ConnectionMonitor<S>,
    ownership: Ownership,
    state: StdMutex<ConnectionState>,
}

impl<S: DatabaseSession> DatabaseConnection<S> {
    /// Opens an owned session and starts monitoring it.
    ///
    /// A failure that happens while `cancel` is set is reported as
    /// [`LockError::Cancelled`]; anything else propagates unchanged.
    pub async fn open<F>(
        connect: F,
        cancel: &CancellationToken,
        keepalive_cadence: Option<Duration>,
    ) -> LockResult<Self>
    where
        F: Future<Output = LockResult<S>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LockError::Cancelled),
            result = connect => result,
        };
        let session = match result {
            Ok(session) => session,
            Err(e) if cancel.is_cancelled() => {
                debug!("connection open failed after cancellation: {}", e);
                return Err(LockError::Cancelled);
            }
            Err(e) => return Err(e),
        };
        Self::start(
            Arc::new(Mutex::new(session)),
            Ownership::Owned,
            TransactionState::None,
            keepalive_cadence,
        )
    }

    /// Wraps a session owned by the caller, adopting its open transaction if
    /// it has one.
    ///
    /// Fails with [`LockError::InvalidOperation`] if the session has already
    /// been closed.
    pub async fn attach(
        session: Arc<Mutex<S>>,
        cancel: &CancellationToken,
        keepalive_cadence: Option<Duration>,
    ) -> LockResult<Self> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let (is_open, in_transaction) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LockError::Cancelled),
            guard = session.lock() => (guard.is_open(), guard.in_transaction()),
        };
        if !is_open {
            return Err(LockError::InvalidOperation(
                "the external connection has been closed".to_string(),
            ));
        }
        let transaction = if in_transaction {
            TransactionState::External
        } else {
            TransactionState::None
        };
        Self::start(session, Ownership::External, transaction, keepalive_cadence)
    }

    fn start(
        session: Arc<Mutex<S>>,
        ownership: Ownership,
        transaction: TransactionState,
        keepalive_cadence: Option<Duration>,
    ) -> LockResult<Self> {
        let monitor = ConnectionMonitor::new(session, keepalive_cadence);
        monitor.start()?;
        Ok(Self {
            monitor,
            ownership,
            state: StdMutex::new(ConnectionState {
                transaction,
                closed: false,
            }),
        })
    }

    fn state(&self) -> StdMutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub fn has_transaction(&self) -> bool {
        self.state().transaction != TransactionState::None
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn monitor(&self) -> &ConnectionMonitor<S> {
        &self.monitor
    }

    fn ensure_not_closed(&self) -> LockResult<()> {
        if self.is_closed() {
            return Err(LockError::InvalidOperation(
                "the connection has been closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Exclusive access to the session for issuing commands.
    pub async fn lock_session(
        &self,
        cancel: &CancellationToken,
    ) -> LockResult<OwnedMutexGuard<S>> {
        self.ensure_not_closed()?;
        self.monitor.acquire_connection_lock(cancel).await
    }

    /// Begins a transaction owned by this connection.
    pub async fn begin_transaction(&self) -> LockResult<()> {
        self.ensure_not_closed()?;
        let mut session = self
            .monitor
            .acquire_connection_lock(&CancellationToken::none())
            .await?;
        if self.state().transaction != TransactionState::None {
            return Err(LockError::InvalidOperation(
                "the connection already has an active transaction".to_string(),
            ));
        }
        session.begin_transaction().await?;
        self.state().transaction = TransactionState::Owned;
        Ok(())
    }

    /// Rolls back a transaction begun by [`begin_transaction`](Self::begin_transaction).
    ///
    /// External transactions are left alone.
    pub async fn dispose_transaction(&self) -> LockResult<()> {
        let mut session = self
            .monitor
            .acquire_connection_lock(&CancellationToken::none())
            .await?;
        self.rollback_owned_transaction(&mut session).await
    }

    async fn rollback_owned_transaction(&self, session: &mut S) -> LockResult<()> {
        let owned = {
            let mut state = self.state();
            let owned = state.transaction == TransactionState::Owned;
            if owned {
                state.transaction = TransactionState::None;
            }
            owned
        };
        if owned && session.is_open() {
            session.rollback_transaction().await?;
        }
        Ok(())
    }

    /// Stops monitoring, rolls back an owned transaction and closes an owned
    /// session. Idempotent.
    pub async fn close(&self) -> LockResult<()> {
        {
            let mut state = self.state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        self.monitor.stop().await;

        // The monitor is stopped, so this lock is uncontended unless a
        // command is still being issued by a caller.
        let mut session = self
            .monitor
            .acquire_connection_lock(&CancellationToken::none())
            .await?;
        let rollback = self.rollback_owned_transaction(&mut session).await;
        if let Err(e) = &rollback {
            warn!("failed to roll back transaction during close: {}", e);
            session.mark_broken();
        }
        if self.is_owned() {
            session.close().await?;
        }
        rollback
    }

    /// Consuming form of [`close`](Self::close).
    pub async fn dispose(self) -> LockResult<()> {
        self.close().await
    }

    /// Waits for `duration` using the session's timer, or until `cancel` fires.
    pub async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> LockResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            _ = S::sleep(duration) => Ok(()),
        }
    }
}

impl<S: DatabaseSession> std::fmt::Debug for DatabaseConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("DatabaseConnection")
            .field("ownership", &self.ownership)
            .field("transaction", &state.transaction)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::data::testing::{FakeBackend, FakeSession};

    async fn open(backend: &FakeBackend) -> DatabaseConnection<FakeSession> {
        DatabaseConnection::open(backend.connect(), &CancellationToken::none(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close_owned() {
        let backend = FakeBackend::new();
        let connection = open(&backend).await;
        assert!(connection.is_owned());
        assert!(connection.monitor().is_running());
        assert_eq!(backend.open_sessions(), 1);

        connection.close().await.unwrap();
        assert!(connection.monitor().is_stopped());
        assert_eq!(backend.open_sessions(), 0);

        // Idempotent.
        connection.close().await.unwrap();
        assert!(matches!(
            connection.lock_session(&CancellationToken::none()).await,
            Err(LockError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_open_with_cancelled_token() {
        let backend = FakeBackend::new();
        let source = CancellationSource::new();
        source.cancel();
        let result = DatabaseConnection::open(backend.connect(), &source.token(), None).await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(backend.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_a_connection_error() {
        let backend = FakeBackend::new();
        backend.refuse_connections(true);
        let result = DatabaseConnection::open(backend.connect(), &CancellationToken::none(), None).await;
        assert!(matches!(result, Err(LockError::Connection(_))));
    }

    #[tokio::test]
    async fn test_open_failure_after_cancel_is_cancellation() {
        let backend = FakeBackend::new();
        backend.refuse_connections(true);
        let source = CancellationSource::new();
        let token = source.token();
        let connect = async {
            source.cancel();
            backend.connect().await
        };
        let result = DatabaseConnection::open(connect, &token, None).await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_second_transaction_is_invalid() {
        let backend = FakeBackend::new();
        let connection = open(&backend).await;

        connection.begin_transaction().await.unwrap();
        assert!(connection.has_transaction());
        assert!(matches!(
            connection.begin_transaction().await,
            Err(LockError::InvalidOperation(_))
        ));

        connection.dispose_transaction().await.unwrap();
        assert!(!connection.has_transaction());
        connection.begin_transaction().await.unwrap();
        connection.dispose().await.unwrap();
        assert_eq!(backend.rollbacks(), 2);
    }

    #[tokio::test]
    async fn test_external_session_survives_close() {
        let backend = FakeBackend::new();
        let mut session = backend.session();
        session.begin_transaction().await.unwrap();
        let shared = Arc::new(Mutex::new(session));

        let connection =
            DatabaseConnection::attach(Arc::clone(&shared), &CancellationToken::none(), None)
                .await
                .unwrap();
        assert!(!connection.is_owned());
        assert!(connection.has_transaction());
        connection.close().await.unwrap();

        let session = shared.lock().await;
        assert!(session.is_open());
        assert!(session.in_transaction());
        assert_eq!(backend.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_attach_closed_session_is_invalid() {
        let backend = FakeBackend::new();
        let mut session = backend.session();
        session.close().await.unwrap();

        let result = DatabaseConnection::attach(
            Arc::new(Mutex::new(session)),
            &CancellationToken::none(),
            None,
        )
        .await;
        assert!(matches!(result, Err(LockError::InvalidOperation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cancellable() {
        let backend = FakeBackend::new();
        let connection = open(&backend).await;

        connection
            .sleep(Duration::from_millis(50), &CancellationToken::none())
            .await
            .unwrap();

        let source = CancellationSource::new();
        source.cancel_after(Duration::from_secs(1));
        let result = connection.sleep(Duration::from_secs(60), &source.token()).await;
        assert!(result.unwrap_err().is_cancelled());
        connection.close().await.unwrap();
    }
}
