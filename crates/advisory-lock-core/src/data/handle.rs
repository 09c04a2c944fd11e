//! Handle to a lock held through the acquisition engine.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::connection::DatabaseConnection;
use super::engine::{AcquireRequest, LockBackend};
use super::multiplex::Lease;
use super::session::DatabaseSession;
use crate::cancellation::CancellationToken;
use crate::error::LockResult;
use crate::traits::{LockHandle, LockMode};

enum Hold<B: LockBackend> {
    Dedicated {
        backend: Arc<B>,
        connection: DatabaseConnection<B::Session>,
        request: AcquireRequest<B::Key>,
    },
    Multiplexed(Lease<B>),
}

impl<B: LockBackend> Hold<B> {
    /// Whether the lock stays held when this side lets go of the session,
    /// which happens when the caller owns the connection.
    fn outlives_session_drop(&self) -> bool {
        match self {
            Self::Dedicated { connection, .. } => !connection.is_owned(),
            Self::Multiplexed(_) => false,
        }
    }

    fn key(&self) -> &B::Key {
        match self {
            Self::Dedicated { request, .. } => &request.key,
            Self::Multiplexed(lease) => lease.key(),
        }
    }

    /// Best-effort release. Never fails; problems are logged.
    async fn release(self) {
        match self {
            Self::Dedicated {
                backend,
                connection,
                request,
            } => {
                // Transaction-scoped locks go away with the transaction.
                if !request.transaction_scoped {
                    match connection.lock_session(&CancellationToken::none()).await {
                        Ok(mut session) if session.is_open() => {
                            if let Err(e) =
                                backend.release(&mut session, &request.key, request.mode).await
                            {
                                warn!("failed to release lock {}: {}", request.key, e);
                                session.mark_broken();
                            }
                        }
                        Ok(_) => {
                            debug!("connection already closed; lock {} released server-side", request.key)
                        }
                        Err(e) => warn!("failed to reach connection for {}: {}", request.key, e),
                    }
                }
                if let Err(e) = connection.close().await {
                    warn!("failed to close connection after releasing {}: {}", request.key, e);
                }
            }
            Self::Multiplexed(lease) => lease.release().await,
        }
    }
}

/// Proof of a successful acquisition.
///
/// Releasing is idempotent: [`close`](Self::close) may be called any number
/// of times, and dropping an unreleased handle schedules the release on the
/// runtime it was acquired on.
pub struct DbLockHandle<B: LockBackend> {
    hold: Option<Hold<B>>,
    mode: LockMode,
    lost: watch::Receiver<bool>,
    runtime: Option<Handle>,
}

impl<B: LockBackend> DbLockHandle<B> {
    pub(crate) fn dedicated(
        backend: Arc<B>,
        connection: DatabaseConnection<B::Session>,
        request: AcquireRequest<B::Key>,
    ) -> Self {
        let lost = connection.monitor().lost_token();
        let mode = request.mode;
        Self::new(
            Hold::Dedicated {
                backend,
                connection,
                request,
            },
            mode,
            lost,
        )
    }

    pub(crate) fn multiplexed(lease: Lease<B>) -> Self {
        let lost = lease.connection().monitor().lost_token();
        let mode = lease.mode();
        Self::new(Hold::Multiplexed(lease), mode, lost)
    }

    fn new(hold: Hold<B>, mode: LockMode, lost: watch::Receiver<bool>) -> Self {
        Self {
            hold: Some(hold),
            mode,
            lost,
            runtime: Handle::try_current().ok(),
        }
    }

    /// The key this handle holds, or `None` once released.
    pub fn key(&self) -> Option<&B::Key> {
        self.hold.as_ref().map(Hold::key)
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_released(&self) -> bool {
        self.hold.is_none()
    }

    /// Whether the lock sits on a connection shared with other holds.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self.hold, Some(Hold::Multiplexed(_)))
    }

    pub fn lost_token(&self) -> &watch::Receiver<bool> {
        &self.lost
    }

    /// Releases the lock if still held. Later calls do nothing.
    pub async fn close(&mut self) {
        if let Some(hold) = self.hold.take() {
            hold.release().await;
        }
    }
}

impl<B: LockBackend> LockHandle for DbLockHandle<B> {
    fn lost_token(&self) -> &watch::Receiver<bool> {
        &self.lost
    }

    #[instrument(skip_all, fields(mode = self.mode.as_str()))]
    async fn release(mut self) -> LockResult<()> {
        self.close().await;
        Ok(())
    }
}

impl<B: LockBackend> Drop for DbLockHandle<B> {
    fn drop(&mut self) {
        let Some(hold) = self.hold.take() else {
            return;
        };
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(hold.release());
            }
            // Dropping an owned connection closes the session, which releases
            // the lock server-side.
            None => {
                if hold.outlives_session_drop() {
                    warn!(
                        "lock {} dropped without a runtime stays held until the caller's connection is closed",
                        hold.key()
                    );
                }
                drop(hold)
            }
        }
    }
}

impl<B: LockBackend> std::fmt::Debug for DbLockHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLockHandle")
            .field("key", &self.key())
            .field("mode", &self.mode)
            .field("released", &self.is_released())
            .finish()
    }
}
