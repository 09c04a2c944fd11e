//! Mock provider for testing provider abstraction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use advisory_lock_core::cancellation::CancellationToken;
use advisory_lock_core::error::{LockError, LockResult};
use advisory_lock_core::traits::{DistributedLock, LockHandle, LockProvider};
use tokio::sync::watch;

/// Mock lock handle for testing. Dropping it releases the lock.
pub struct MockLockHandle {
    held: Arc<watch::Sender<bool>>,
    lost_receiver: watch::Receiver<bool>,
}

impl LockHandle for MockLockHandle {
    fn lost_token(&self) -> &watch::Receiver<bool> {
        &self.lost_receiver
    }

    async fn release(self) -> LockResult<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MockLockHandle {
    fn drop(&mut self) {
        self.held.send_replace(false);
    }
}

/// Mock distributed lock for testing.
pub struct MockDistributedLock {
    name: String,
    held: Arc<watch::Sender<bool>>,
}

impl MockDistributedLock {
    fn try_take(&self) -> Option<MockLockHandle> {
        let taken = self.held.send_if_modified(|held| {
            if *held {
                false
            } else {
                *held = true;
                true
            }
        });
        taken.then(|| {
            let (_, lost_receiver) = watch::channel(false);
            MockLockHandle {
                held: Arc::clone(&self.held),
                lost_receiver,
            }
        })
    }
}

impl DistributedLock for MockDistributedLock {
    type Handle = MockLockHandle;

    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<Self::Handle>> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        let mut receiver = self.held.subscribe();
        loop {
            if let Some(handle) = self.try_take() {
                return Ok(Some(handle));
            }
            let expired = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = receiver.wait_for(|held| !*held) => false,
                _ = sleep_until(deadline) => true,
            };
            if expired {
                return Ok(None);
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Mock provider for testing provider abstraction.
pub struct MockLockProvider {
    locks: Arc<Mutex<HashMap<String, Arc<watch::Sender<bool>>>>>,
}

impl MockLockProvider {
    /// Creates a new mock provider.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MockLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LockProvider for MockLockProvider {
    type Lock = MockDistributedLock;

    fn create_lock(&self, name: &str) -> Self::Lock {
        let mut locks = self.locks.lock().unwrap();
        let held = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(watch::Sender::new(false)))
            .clone();

        MockDistributedLock {
            name: name.to_string(),
            held,
        }
    }
}
