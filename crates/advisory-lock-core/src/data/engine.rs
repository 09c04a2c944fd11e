//! The backend-neutral try-acquire / timeout / cancel state machine.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant};
use tracing::{debug, field, instrument, warn, Span};

use super::connection::DatabaseConnection;
use super::handle::DbLockHandle;
use super::multiplex::MultiplexedConnectionPool;
use super::session::DatabaseSession;
use crate::cancellation::CancellationToken;
use crate::error::{LockError, LockResult};
use crate::executor::current_mode;
use crate::timeout::TimeoutValue;
use crate::traits::LockMode;

// ============================================================================
// Backend Adapter
// ============================================================================

/// Everything a backend needs to know to issue one acquire command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest<K> {
    pub key: K,
    pub mode: LockMode,
    /// Released by the end of the transaction rather than an explicit command.
    pub transaction_scoped: bool,
    /// The session has an open transaction (owned or external).
    pub in_transaction: bool,
    /// The session belongs to the caller.
    pub externally_owned: bool,
}

/// Translates abstract lock operations into backend commands.
///
/// Implementations supply the primitives; [`AcquisitionEngine`] supplies
/// timeouts, cancellation and connection lifecycle on top of them.
pub trait LockBackend: Send + Sync + 'static {
    type Session: DatabaseSession;
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;
    type SessionId: Clone + Debug + Send + Sync + 'static;

    /// Opens a fresh session for one acquisition attempt.
    fn open_session(&self) -> impl Future<Output = LockResult<Self::Session>> + Send + 'static;

    /// Server-side identity of `session`, used as the target of
    /// [`cancel_session`](Self::cancel_session).
    fn session_id(
        &self,
        session: &mut Self::Session,
    ) -> impl Future<Output = LockResult<Self::SessionId>> + Send;

    /// Aborts whatever command `target` is running, from a different session.
    fn cancel_session(
        &self,
        target: &Self::SessionId,
    ) -> impl Future<Output = LockResult<()>> + Send;

    /// Whether [`blocking_acquire`](Self::blocking_acquire) can enforce
    /// `timeout` on its own. When it cannot, the engine bounds the wait with
    /// its own timer.
    fn has_native_timeout(&self, _timeout: TimeoutValue) -> bool {
        false
    }

    /// Single non-blocking attempt.
    fn try_acquire(
        &self,
        session: &mut Self::Session,
        request: &AcquireRequest<Self::Key>,
    ) -> impl Future<Output = LockResult<bool>> + Send;

    /// Waits for the lock.
    ///
    /// When [`has_native_timeout`](Self::has_native_timeout) accepts the
    /// timeout, the backend honors it and returns `Ok(false)` when it
    /// elapses; otherwise it receives [`TimeoutValue::INFINITE`]. A command
    /// interrupted by [`cancel_session`](Self::cancel_session) must fail with
    /// [`LockError::Cancelled`].
    fn blocking_acquire(
        &self,
        session: &mut Self::Session,
        request: &AcquireRequest<Self::Key>,
        timeout: TimeoutValue,
    ) -> impl Future<Output = LockResult<bool>> + Send;

    fn release(
        &self,
        session: &mut Self::Session,
        key: &Self::Key,
        mode: LockMode,
    ) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// Engine
// ============================================================================

/// Where the engine gets its connection from.
pub enum ConnectionSource<S> {
    /// A new session per attempt, opened through the backend.
    Owned,
    /// A session supplied by the caller, possibly inside the caller's
    /// transaction.
    External(Arc<Mutex<S>>),
}

impl<S> Clone for ConnectionSource<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Owned => Self::Owned,
            Self::External(session) => Self::External(Arc::clone(session)),
        }
    }
}

impl<S> Debug for ConnectionSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owned => f.write_str("Owned"),
            Self::External(_) => f.write_str("External"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub transaction_scoped: bool,
    pub keepalive_cadence: Option<Duration>,
    pub multiplexing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortTrigger {
    Cancellation,
    Timeout,
}

enum Wait {
    Completed(LockResult<bool>),
    Aborted(AbortTrigger, LockResult<bool>),
    /// The command never yielded to repeated cancels.
    Abandoned(AbortTrigger),
    SideChannelFailed(LockError),
}

/// Interval at which an abort is re-sent while the command is still running.
const RECANCEL_INTERVAL: Duration = Duration::from_millis(500);

/// How long an aborted command may keep running before its session is
/// abandoned.
const ABANDON_AFTER: Duration = Duration::from_secs(10);

/// Runs acquisition attempts for one lock against one connection source.
pub struct AcquisitionEngine<B: LockBackend> {
    backend: Arc<B>,
    source: ConnectionSource<B::Session>,
    options: EngineOptions,
    multiplexer: Option<Arc<MultiplexedConnectionPool<B>>>,
}

impl<B: LockBackend> AcquisitionEngine<B> {
    /// Creates an engine that opens a connection per attempt.
    ///
    /// Multiplexing only takes effect once a pool shared with other engines
    /// is supplied through [`with_multiplexer`](Self::with_multiplexer).
    pub fn new(backend: Arc<B>, source: ConnectionSource<B::Session>, options: EngineOptions) -> Self {
        Self {
            backend,
            source,
            options,
            multiplexer: None,
        }
    }

    /// Shares `pool` with other engines on the same backend.
    ///
    /// Ignored unless multiplexing is enabled and the engine opens its own
    /// session-scoped connections.
    pub fn with_multiplexer(mut self, pool: Arc<MultiplexedConnectionPool<B>>) -> Self {
        if self.options.multiplexing
            && !self.options.transaction_scoped
            && matches!(self.source, ConnectionSource::Owned)
        {
            self.multiplexer = Some(pool);
        }
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn source(&self) -> &ConnectionSource<B::Session> {
        &self.source
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer.is_some()
    }

    /// Attempts to acquire `key` in `mode`.
    ///
    /// Returns `Ok(None)` when `timeout` elapses first and
    /// `Err(LockError::Cancelled)` when `cancel` fires first.
    #[instrument(
        skip_all,
        fields(
            lock.key = %key,
            mode = mode.as_str(),
            timeout = %timeout,
            execution = current_mode().as_str(),
            acquired = field::Empty,
        )
    )]
    pub async fn try_acquire(
        &self,
        key: B::Key,
        mode: LockMode,
        timeout: TimeoutValue,
        cancel: &CancellationToken,
    ) -> LockResult<Option<DbLockHandle<B>>> {
        let result = self.try_acquire_inner(key, mode, timeout, cancel).await;
        if let Ok(handle) = &result {
            Span::current().record("acquired", handle.is_some());
        }
        result
    }

    async fn try_acquire_inner(
        &self,
        key: B::Key,
        mode: LockMode,
        timeout: TimeoutValue,
        cancel: &CancellationToken,
    ) -> LockResult<Option<DbLockHandle<B>>> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        if let Some(multiplexer) = &self.multiplexer {
            if let Some(handle) = multiplexer
                .try_acquire(&key, mode, self.options.keepalive_cadence, cancel)
                .await?
            {
                debug!("acquired on a multiplexed connection");
                return Ok(Some(handle));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            debug!("promoting to a dedicated connection for a blocking wait");
        }

        let connection = match &self.source {
            ConnectionSource::Owned => {
                DatabaseConnection::open(
                    self.backend.open_session(),
                    cancel,
                    self.options.keepalive_cadence,
                )
                .await?
            }
            ConnectionSource::External(session) => {
                DatabaseConnection::attach(
                    Arc::clone(session),
                    cancel,
                    self.options.keepalive_cadence,
                )
                .await?
            }
        };

        match self.acquire_on(&connection, key, mode, timeout, cancel).await {
            Ok(Some(request)) => Ok(Some(DbLockHandle::dedicated(
                Arc::clone(&self.backend),
                connection,
                request,
            ))),
            outcome => {
                if let Err(e) = connection.close().await {
                    warn!("failed to dispose connection after unsuccessful acquire: {}", e);
                }
                outcome.map(|_| None)
            }
        }
    }

    /// Runs the acquire command on `connection`. `Ok(None)` means timed out.
    async fn acquire_on(
        &self,
        connection: &DatabaseConnection<B::Session>,
        key: B::Key,
        mode: LockMode,
        timeout: TimeoutValue,
        cancel: &CancellationToken,
    ) -> LockResult<Option<AcquireRequest<B::Key>>> {
        if self.options.transaction_scoped {
            if connection.is_owned() {
                connection.begin_transaction().await?;
            } else if !connection.has_transaction() {
                return Err(LockError::InvalidOperation(
                    "transaction-scoped locks on an external connection require an open transaction"
                        .to_string(),
                ));
            }
        }
        let request = AcquireRequest {
            key,
            mode,
            transaction_scoped: self.options.transaction_scoped,
            in_transaction: connection.has_transaction(),
            externally_owned: !connection.is_owned(),
        };

        let mut session = connection.lock_session(cancel).await?;

        if timeout.is_zero() {
            let acquired = self.backend.try_acquire(&mut session, &request).await?;
            return Ok(acquired.then_some(request));
        }

        let session_id = self.backend.session_id(&mut session).await?;
        let native = self.backend.has_native_timeout(timeout);
        let (command_timeout, timer) = if native {
            (timeout, None)
        } else {
            (TimeoutValue::INFINITE, timeout.as_duration())
        };

        let wait = {
            let command = self
                .backend
                .blocking_acquire(&mut session, &request, command_timeout);
            tokio::pin!(command);

            let trigger = tokio::select! {
                biased;
                result = &mut command => Err(result),
                _ = cancel.cancelled() => Ok(AbortTrigger::Cancellation),
                slept = connection.sleep(timer.unwrap_or_default(), cancel), if timer.is_some() => {
                    Ok(match slept {
                        Ok(()) => AbortTrigger::Timeout,
                        Err(_) => AbortTrigger::Cancellation,
                    })
                }
            };

            match trigger {
                Err(result) => Wait::Completed(result),
                Ok(trigger) => {
                    debug!(?trigger, "aborting blocked acquire through a side channel");
                    match self.backend.cancel_session(&session_id).await {
                        Ok(()) => match self.await_aborted(command.as_mut(), &session_id).await {
                            Some(result) => Wait::Aborted(trigger, result),
                            None => Wait::Abandoned(trigger),
                        },
                        Err(e) => Wait::SideChannelFailed(e),
                    }
                }
            }
        };

        let acquired = match wait {
            Wait::Completed(result) => result?,
            Wait::SideChannelFailed(e) => {
                warn!("side-channel cancel failed; abandoning the connection: {}", e);
                session.mark_broken();
                return Err(e);
            }
            Wait::Abandoned(trigger) => {
                warn!(?trigger, "blocked acquire ignored cancellation; abandoning the connection");
                session.mark_broken();
                if trigger == AbortTrigger::Cancellation {
                    return Err(LockError::Cancelled);
                }
                false
            }
            Wait::Aborted(AbortTrigger::Timeout, Err(LockError::Cancelled)) => false,
            Wait::Aborted(AbortTrigger::Timeout, result) => result?,
            Wait::Aborted(AbortTrigger::Cancellation, Ok(true)) => {
                debug!("lock was granted after cancellation; releasing it");
                if request.transaction_scoped {
                    if request.externally_owned {
                        warn!(
                            "lock granted after cancellation stays held until the caller's transaction ends"
                        );
                    }
                } else if let Err(e) = self
                    .backend
                    .release(&mut session, &request.key, request.mode)
                    .await
                {
                    warn!("failed to release lock granted after cancellation: {}", e);
                    session.mark_broken();
                }
                return Err(LockError::Cancelled);
            }
            Wait::Aborted(AbortTrigger::Cancellation, Ok(false) | Err(LockError::Cancelled)) => {
                return Err(LockError::Cancelled);
            }
            Wait::Aborted(AbortTrigger::Cancellation, Err(e)) => return Err(e),
        };
        Ok(acquired.then_some(request))
    }

    /// Awaits a command that the side channel was asked to abort.
    ///
    /// A cancel that reaches the server between two statements of the command
    /// has no effect, so it is re-sent until the command resolves. `None`
    /// means it never did within [`ABANDON_AFTER`].
    async fn await_aborted<F>(
        &self,
        mut command: Pin<&mut F>,
        session_id: &B::SessionId,
    ) -> Option<LockResult<bool>>
    where
        F: Future<Output = LockResult<bool>>,
    {
        let deadline = tokio::time::sleep(ABANDON_AFTER);
        tokio::pin!(deadline);
        let mut retries = interval_at(Instant::now() + RECANCEL_INTERVAL, RECANCEL_INTERVAL);
        loop {
            tokio::select! {
                biased;
                result = command.as_mut() => return Some(result),
                _ = &mut deadline => return None,
                _ = retries.tick() => {
                    debug!("command still running after abort; cancelling again");
                    if let Err(e) = self.backend.cancel_session(session_id).await {
                        debug!("repeated side-channel cancel failed: {}", e);
                    }
                }
            }
        }
    }
}

impl<B: LockBackend> Debug for AcquisitionEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("source", &self.source)
            .field("options", &self.options)
            .field("multiplexed", &self.multiplexer.is_some())
            .finish()
    }
}
