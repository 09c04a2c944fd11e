//! In-memory lock server for exercising the engine without a database.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use super::engine::{AcquireRequest, LockBackend};
use super::session::DatabaseSession;
use crate::error::{LockError, LockResult};
use crate::timeout::TimeoutValue;
use crate::traits::LockMode;

/// What the fake does when asked to cancel a session's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelBehavior {
    Cancel,
    /// Counts the request but lets the command keep waiting.
    Ignore,
    /// Only interrupts a command that is already waiting for the lock; a
    /// request that arrives earlier is lost.
    WhileWaiting,
    Fail,
}

#[derive(Default)]
struct Holders {
    exclusive: Option<u64>,
    shared: HashMap<u64, usize>,
}

impl Holders {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

struct Server {
    locks: StdMutex<HashMap<u64, Holders>>,
    changed: Notify,
    cancel_requests: StdMutex<HashSet<u64>>,
    cancel_behavior: StdMutex<CancelBehavior>,
    waiting: StdMutex<HashSet<u64>>,
    setup_delay: StdMutex<Duration>,
    next_session: AtomicU64,
    sessions_opened: AtomicUsize,
    open_sessions: AtomicUsize,
    probes: AtomicUsize,
    rollbacks: AtomicUsize,
    side_channel_cancels: AtomicUsize,
    broken_sessions: AtomicUsize,
    explicit_releases: AtomicUsize,
    down: AtomicBool,
    refuse: AtomicBool,
    fail_releases: AtomicBool,
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Server {
    fn try_take(&self, session: u64, key: u64, mode: LockMode) -> bool {
        let mut locks = lock(&self.locks);
        let holders = locks.entry(key).or_default();
        match mode {
            LockMode::Exclusive if holders.is_free() => {
                holders.exclusive = Some(session);
                true
            }
            LockMode::Shared if holders.exclusive.is_none() => {
                *holders.shared.entry(session).or_default() += 1;
                true
            }
            _ => false,
        }
    }

    fn give_back(&self, session: u64, key: u64, mode: LockMode) {
        {
            let mut locks = lock(&self.locks);
            let Some(holders) = locks.get_mut(&key) else {
                return;
            };
            match mode {
                LockMode::Exclusive => {
                    if holders.exclusive == Some(session) {
                        holders.exclusive = None;
                    }
                }
                LockMode::Shared => {
                    if let Some(count) = holders.shared.get_mut(&session) {
                        *count -= 1;
                        if *count == 0 {
                            holders.shared.remove(&session);
                        }
                    }
                }
            }
        }
        self.changed.notify_waiters();
    }

    fn release_all(&self, session: u64) {
        {
            let mut locks = lock(&self.locks);
            for holders in locks.values_mut() {
                if holders.exclusive == Some(session) {
                    holders.exclusive = None;
                }
                holders.shared.remove(&session);
            }
        }
        self.changed.notify_waiters();
    }

    fn take_cancel_request(&self, session: u64) -> bool {
        lock(&self.cancel_requests).remove(&session)
    }
}

#[derive(Clone)]
pub struct FakeBackend {
    server: Arc<Server>,
    native_timeout: bool,
    /// Longest timeout the native mechanism can express.
    native_limit: Option<Duration>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            server: Arc::new(Server {
                locks: StdMutex::new(HashMap::new()),
                changed: Notify::new(),
                cancel_requests: StdMutex::new(HashSet::new()),
                cancel_behavior: StdMutex::new(CancelBehavior::Cancel),
                waiting: StdMutex::new(HashSet::new()),
                setup_delay: StdMutex::new(Duration::ZERO),
                next_session: AtomicU64::new(1),
                sessions_opened: AtomicUsize::new(0),
                open_sessions: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                side_channel_cancels: AtomicUsize::new(0),
                broken_sessions: AtomicUsize::new(0),
                explicit_releases: AtomicUsize::new(0),
                down: AtomicBool::new(false),
                refuse: AtomicBool::new(false),
                fail_releases: AtomicBool::new(false),
            }),
            native_timeout: false,
            native_limit: None,
        }
    }

    pub fn with_native_timeout() -> Self {
        Self {
            native_timeout: true,
            ..Self::new()
        }
    }

    /// Native timeouts only up to `limit`; longer ones fall to the engine.
    pub fn with_native_timeout_limit(limit: Duration) -> Self {
        Self {
            native_limit: Some(limit),
            ..Self::with_native_timeout()
        }
    }

    /// Opens a session synchronously.
    pub fn session(&self) -> FakeSession {
        let server = Arc::clone(&self.server);
        server.sessions_opened.fetch_add(1, Ordering::SeqCst);
        server.open_sessions.fetch_add(1, Ordering::SeqCst);
        FakeSession {
            id: server.next_session.fetch_add(1, Ordering::SeqCst),
            server,
            closed: false,
            broken: false,
            transaction_keys: None,
        }
    }

    pub fn connect(&self) -> impl Future<Output = LockResult<FakeSession>> + Send + 'static {
        let backend = self.clone();
        async move {
            tokio::task::yield_now().await;
            if backend.server.refuse.load(Ordering::SeqCst) {
                return Err(LockError::connection("connection refused"));
            }
            Ok(backend.session())
        }
    }

    pub fn set_cancel_behavior(&self, behavior: CancelBehavior) {
        *lock(&self.server.cancel_behavior) = behavior;
    }

    /// Time a blocking acquire spends before it starts waiting.
    pub fn set_setup_delay(&self, delay: Duration) {
        *lock(&self.server.setup_delay) = delay;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.server.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.server.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Every session's next command fails as if the network dropped.
    pub fn kill_sessions(&self) {
        self.server.down.store(true, Ordering::SeqCst);
    }

    pub fn is_held(&self, key: u64) -> bool {
        lock(&self.server.locks)
            .get(&key)
            .is_some_and(|holders| !holders.is_free())
    }

    pub fn sessions_opened(&self) -> usize {
        self.server.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.server.open_sessions.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.server.probes.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.server.rollbacks.load(Ordering::SeqCst)
    }

    pub fn side_channel_cancels(&self) -> usize {
        self.server.side_channel_cancels.load(Ordering::SeqCst)
    }

    pub fn broken_sessions(&self) -> usize {
        self.server.broken_sessions.load(Ordering::SeqCst)
    }

    pub fn explicit_releases(&self) -> usize {
        self.server.explicit_releases.load(Ordering::SeqCst)
    }
}

pub struct FakeSession {
    id: u64,
    server: Arc<Server>,
    closed: bool,
    broken: bool,
    /// Transaction-scoped holds, present while a transaction is open.
    transaction_keys: Option<Vec<(u64, LockMode)>>,
}

impl FakeSession {
    fn check(&mut self) -> LockResult<()> {
        if !self.is_open() {
            return Err(LockError::connection("session is closed"));
        }
        if self.server.down.load(Ordering::SeqCst) {
            self.mark_broken();
            return Err(LockError::connection("server went away"));
        }
        Ok(())
    }

    fn record(&mut self, request: &AcquireRequest<u64>) {
        if request.transaction_scoped {
            if let Some(keys) = &mut self.transaction_keys {
                keys.push((request.key, request.mode));
            }
        }
    }

    fn shut(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.release_all(self.id);
            self.server.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for FakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSession")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.shut();
    }
}

impl DatabaseSession for FakeSession {
    fn is_open(&self) -> bool {
        !self.closed && !self.broken
    }

    fn in_transaction(&self) -> bool {
        self.transaction_keys.is_some()
    }

    fn mark_broken(&mut self) {
        if !self.broken {
            self.broken = true;
            self.server.broken_sessions.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn keepalive_probe(&mut self) -> LockResult<()> {
        self.check()?;
        self.server.probes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn begin_transaction(&mut self) -> LockResult<()> {
        self.check()?;
        self.transaction_keys = Some(Vec::new());
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> LockResult<()> {
        self.check()?;
        self.server.rollbacks.fetch_add(1, Ordering::SeqCst);
        for (key, mode) in self.transaction_keys.take().unwrap_or_default() {
            self.server.give_back(self.id, key, mode);
        }
        Ok(())
    }

    async fn close(&mut self) -> LockResult<()> {
        self.shut();
        Ok(())
    }
}

impl LockBackend for FakeBackend {
    type Session = FakeSession;
    type Key = u64;
    type SessionId = u64;

    fn open_session(&self) -> impl Future<Output = LockResult<FakeSession>> + Send + 'static {
        self.connect()
    }

    async fn session_id(&self, session: &mut FakeSession) -> LockResult<u64> {
        session.check()?;
        Ok(session.id)
    }

    async fn cancel_session(&self, target: &u64) -> LockResult<()> {
        self.server.side_channel_cancels.fetch_add(1, Ordering::SeqCst);
        let behavior = *lock(&self.server.cancel_behavior);
        match behavior {
            CancelBehavior::Cancel => {
                lock(&self.server.cancel_requests).insert(*target);
                self.server.changed.notify_waiters();
                Ok(())
            }
            CancelBehavior::Ignore => Ok(()),
            CancelBehavior::WhileWaiting => {
                if lock(&self.server.waiting).contains(target) {
                    lock(&self.server.cancel_requests).insert(*target);
                    self.server.changed.notify_waiters();
                }
                Ok(())
            }
            CancelBehavior::Fail => Err(LockError::connection("side channel unavailable")),
        }
    }

    fn has_native_timeout(&self, timeout: TimeoutValue) -> bool {
        self.native_timeout
            && match (self.native_limit, timeout.as_duration()) {
                (Some(limit), Some(requested)) => requested <= limit,
                _ => true,
            }
    }

    async fn try_acquire(
        &self,
        session: &mut FakeSession,
        request: &AcquireRequest<u64>,
    ) -> LockResult<bool> {
        session.check()?;
        let acquired = self.server.try_take(session.id, request.key, request.mode);
        if acquired {
            session.record(request);
        }
        Ok(acquired)
    }

    async fn blocking_acquire(
        &self,
        session: &mut FakeSession,
        request: &AcquireRequest<u64>,
        timeout: TimeoutValue,
    ) -> LockResult<bool> {
        session.check()?;
        let setup_delay = *lock(&self.server.setup_delay);
        if !setup_delay.is_zero() {
            tokio::time::sleep(setup_delay).await;
        }
        let server = Arc::clone(&self.server);
        lock(&server.waiting).insert(session.id);
        let wait = async {
            loop {
                let notified = server.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if server.take_cancel_request(session.id) {
                    return Err(LockError::Cancelled);
                }
                if server.try_take(session.id, request.key, request.mode) {
                    session.record(request);
                    return Ok(true);
                }
                notified.await;
            }
        };
        let result = match timeout.as_duration() {
            Some(limit) if self.native_timeout => {
                tokio::time::timeout(limit, wait).await.unwrap_or(Ok(false))
            }
            _ => wait.await,
        };
        lock(&server.waiting).remove(&session.id);
        result
    }

    async fn release(&self, session: &mut FakeSession, key: &u64, mode: LockMode) -> LockResult<()> {
        session.check()?;
        if self.server.fail_releases.load(Ordering::SeqCst) {
            return Err(LockError::backend("release rejected"));
        }
        self.server.explicit_releases.fetch_add(1, Ordering::SeqCst);
        self.server.give_back(session.id, *key, mode);
        Ok(())
    }
}
