//! Sharing physical connections between non-blocking acquisitions.
//!
//! A connection can carry holds on many distinct keys but never two holds on
//! the same key. Blocking waits never run here; the engine promotes them to a
//! dedicated connection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use super::connection::DatabaseConnection;
use super::engine::{AcquireRequest, LockBackend};
use super::handle::DbLockHandle;
use super::monitor::MonitoringHandle;
use super::session::DatabaseSession;
use crate::cancellation::CancellationToken;
use crate::error::LockResult;
use crate::traits::LockMode;

type SharedConnection<B> = Arc<DatabaseConnection<<B as LockBackend>::Session>>;

struct Slot<B: LockBackend> {
    id: u64,
    connection: SharedConnection<B>,
    /// Keys held or being attempted on this connection.
    keys: HashSet<B::Key>,
    /// A failed command left the connection in doubt; take no new keys.
    retired: bool,
}

/// Connections shared by lock attempts that never wait.
pub struct MultiplexedConnectionPool<B: LockBackend> {
    backend: Arc<B>,
    slots: StdMutex<Vec<Slot<B>>>,
    next_id: AtomicU64,
}

impl<B: LockBackend> MultiplexedConnectionPool<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slots: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> StdMutexGuard<'_, Vec<Slot<B>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of physical connections currently open.
    pub fn connection_count(&self) -> usize {
        self.slots().len()
    }

    /// Claims `key` on an existing connection that does not carry it yet.
    fn reserve(&self, key: &B::Key) -> Option<(u64, SharedConnection<B>)> {
        let mut slots = self.slots();
        let slot = slots
            .iter_mut()
            .find(|slot| !slot.retired && !slot.keys.contains(key))?;
        slot.keys.insert(key.clone());
        Some((slot.id, Arc::clone(&slot.connection)))
    }

    /// Single non-blocking attempt on a shared connection.
    pub async fn try_acquire(
        self: &Arc<Self>,
        key: &B::Key,
        mode: LockMode,
        keepalive_cadence: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<DbLockHandle<B>>> {
        let (slot_id, connection) = match self.reserve(key) {
            Some(reserved) => reserved,
            None => {
                let connection = Arc::new(
                    DatabaseConnection::open(self.backend.open_session(), cancel, None).await?,
                );
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                debug!(connection = id, "opened multiplexed connection");
                self.slots().push(Slot {
                    id,
                    connection: Arc::clone(&connection),
                    keys: HashSet::from([key.clone()]),
                    retired: false,
                });
                (id, connection)
            }
        };

        let request = AcquireRequest {
            key: key.clone(),
            mode,
            transaction_scoped: false,
            in_transaction: false,
            externally_owned: false,
        };
        let result = async {
            let mut session = connection.lock_session(cancel).await?;
            self.backend.try_acquire(&mut session, &request).await
        }
        .await;

        match result {
            Ok(true) => {
                let monitoring = connection.monitor().monitoring_handle(keepalive_cadence);
                Ok(Some(DbLockHandle::multiplexed(
                    Lease {
                        pool: Arc::clone(self),
                        slot_id,
                        connection,
                        key: key.clone(),
                        mode,
                        monitoring,
                    },
                )))
            }
            Ok(false) => {
                self.forget(slot_id, key, false).await;
                Ok(None)
            }
            Err(e) => {
                self.forget(slot_id, key, true).await;
                Err(e)
            }
        }
    }

    /// Drops `key` from its slot, closing the connection once it carries
    /// nothing.
    async fn forget(&self, slot_id: u64, key: &B::Key, retire: bool) {
        let emptied = {
            let mut slots = self.slots();
            let Some(index) = slots.iter().position(|slot| slot.id == slot_id) else {
                return;
            };
            let slot = &mut slots[index];
            slot.keys.remove(key);
            slot.retired |= retire;
            if slot.keys.is_empty() {
                Some(slots.swap_remove(index).connection)
            } else {
                None
            }
        };
        if let Some(connection) = emptied {
            debug!(connection = slot_id, "closing idle multiplexed connection");
            if let Err(e) = connection.close().await {
                warn!("failed to close multiplexed connection: {}", e);
            }
        }
    }
}

impl<B: LockBackend> std::fmt::Debug for MultiplexedConnectionPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// A hold on a shared connection.
pub(crate) struct Lease<B: LockBackend> {
    pool: Arc<MultiplexedConnectionPool<B>>,
    slot_id: u64,
    connection: SharedConnection<B>,
    key: B::Key,
    mode: LockMode,
    monitoring: MonitoringHandle,
}

impl<B: LockBackend> Lease<B> {
    pub(crate) fn connection(&self) -> &DatabaseConnection<B::Session> {
        &self.connection
    }

    pub(crate) fn key(&self) -> &B::Key {
        &self.key
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    pub(crate) async fn release(self) {
        let Self {
            pool,
            slot_id,
            connection,
            key,
            mode,
            monitoring,
        } = self;
        drop(monitoring);

        let mut retire = false;
        match connection.lock_session(&CancellationToken::none()).await {
            Ok(mut session) if session.is_open() => {
                if let Err(e) = pool.backend.release(&mut session, &key, mode).await {
                    warn!("failed to release multiplexed lock {}: {}", key, e);
                    retire = true;
                }
            }
            Ok(_) => debug!("multiplexed connection already closed; lock {} released server-side", key),
            Err(e) => warn!("failed to reach multiplexed connection for {}: {}", key, e),
        }
        drop(connection);
        pool.forget(slot_id, &key, retire).await;
    }
}
