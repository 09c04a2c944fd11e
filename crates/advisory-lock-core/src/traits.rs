//! Core traits for distributed locks.

use std::future::Future;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::error::{LockError, LockResult};
use crate::timeout::TimeoutValue;

// ============================================================================
// Lock Mode
// ============================================================================

/// How a lock is held on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Single holder (mutex, writer).
    Exclusive,
    /// Many concurrent holders, excluded by any exclusive holder (reader).
    Shared,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        }
    }
}

// ============================================================================
// Lock Handle Trait
// ============================================================================

/// Handle to a held distributed lock.
///
/// Dropping this handle releases the lock. For proper error handling in async
/// contexts, call `release()` explicitly.
///
/// # Example
///
/// ```rust,ignore
/// let handle = lock.acquire(None).await?;
/// // Critical section - we hold the lock
/// do_work().await;
/// handle.release().await?;
/// ```
pub trait LockHandle: Send + Sync + Sized {
    /// Returns a receiver that signals when the lock is lost.
    ///
    /// The receiver yields `true` once the keepalive monitor finds the
    /// connection holding the lock dead. Without a keepalive cadence the
    /// loss is only noticed by the next command on that connection.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut lost = handle.lost_token().clone();
    /// tokio::select! {
    ///     _ = lost.wait_for(|lost| *lost) => {
    ///         eprintln!("Lock was lost!");
    ///     }
    ///     _ = do_work() => {}
    /// }
    /// ```
    fn lost_token(&self) -> &tokio::sync::watch::Receiver<bool>;

    /// Explicitly releases the lock.
    ///
    /// Release is best-effort: failures of the release command are logged and
    /// the connection is torn down anyway, which releases the lock server-side.
    fn release(self) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// Distributed Lock Trait
// ============================================================================

/// A distributed mutual exclusion lock.
///
/// Provides exclusive access to a resource identified by `name` across
/// processes and machines.
///
/// # Example
///
/// ```rust,ignore
/// use advisory_lock_core::DistributedLock;
///
/// async fn protected_operation(lock: &impl DistributedLock) -> Result<(), Error> {
///     let handle = lock.acquire(Some(Duration::from_secs(5))).await?;
///     perform_critical_section().await?;
///     handle.release().await?;
///     Ok(())
/// }
/// ```
pub trait DistributedLock: Send + Sync {
    /// The handle type returned when the lock is acquired.
    type Handle: LockHandle + Send;

    /// Returns the unique name identifying this lock.
    fn name(&self) -> &str;

    /// Attempts to acquire the lock, waiting up to `timeout`.
    ///
    /// * `Some(Duration::ZERO)` - a single non-blocking attempt
    /// * `None` - wait indefinitely
    ///
    /// # Returns
    ///
    /// * `Ok(Some(handle))` - Lock acquired
    /// * `Ok(None)` - Timeout elapsed (a normal outcome)
    /// * `Err(LockError::Cancelled)` - `cancel` fired first
    /// * `Err(LockError::Connection)` - Backend connection failed
    fn try_acquire_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = LockResult<Option<Self::Handle>>> + Send;

    /// Attempts to acquire the lock without waiting.
    fn try_acquire(&self) -> impl Future<Output = LockResult<Option<Self::Handle>>> + Send {
        async move {
            let cancel = CancellationToken::none();
            self.try_acquire_with(Some(Duration::ZERO), &cancel).await
        }
    }

    /// Acquires the lock, failing with [`LockError::Timeout`] when `timeout`
    /// elapses first.
    fn acquire_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = LockResult<Self::Handle>> + Send {
        async move {
            self.try_acquire_with(timeout, cancel)
                .await?
                .ok_or_else(|| LockError::Timeout(TimeoutValue::from(timeout).elapsed_budget()))
        }
    }

    /// Acquires the lock, waiting up to `timeout` (`None` waits indefinitely).
    fn acquire(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = LockResult<Self::Handle>> + Send {
        async move {
            let cancel = CancellationToken::none();
            self.acquire_with(timeout, &cancel).await
        }
    }
}

// ============================================================================
// Reader-Writer Lock Trait
// ============================================================================

/// A distributed reader-writer lock.
///
/// Allows multiple concurrent readers OR a single exclusive writer. Ordering
/// among waiters is whatever the backend provides.
///
/// # Example
///
/// ```rust,ignore
/// let read_handle = lock.acquire_read(None).await?;
/// let data = read_shared_resource().await;
/// read_handle.release().await?;
///
/// let write_handle = lock.acquire_write(None).await?;
/// modify_shared_resource().await;
/// write_handle.release().await?;
/// ```
pub trait DistributedReaderWriterLock: Send + Sync {
    /// Handle type for read (shared) locks.
    type ReadHandle: LockHandle + Send;
    /// Handle type for write (exclusive) locks.
    type WriteHandle: LockHandle + Send;

    /// Returns the unique name identifying this lock.
    fn name(&self) -> &str;

    /// Attempts to acquire a read lock, waiting up to `timeout`.
    fn try_acquire_read_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = LockResult<Option<Self::ReadHandle>>> + Send;

    /// Attempts to acquire a write lock, waiting up to `timeout`.
    fn try_acquire_write_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = LockResult<Option<Self::WriteHandle>>> + Send;

    /// Acquires a read (shared) lock.
    ///
    /// Multiple readers can hold the lock concurrently.
    fn acquire_read(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = LockResult<Self::ReadHandle>> + Send {
        async move {
            let cancel = CancellationToken::none();
            self.try_acquire_read_with(timeout, &cancel)
                .await?
                .ok_or_else(|| LockError::Timeout(TimeoutValue::from(timeout).elapsed_budget()))
        }
    }

    /// Attempts to acquire a read lock without waiting.
    fn try_acquire_read(
        &self,
    ) -> impl Future<Output = LockResult<Option<Self::ReadHandle>>> + Send {
        async move {
            let cancel = CancellationToken::none();
            self.try_acquire_read_with(Some(Duration::ZERO), &cancel).await
        }
    }

    /// Acquires a write (exclusive) lock.
    ///
    /// Only one writer can hold the lock. Blocks all readers.
    fn acquire_write(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = LockResult<Self::WriteHandle>> + Send {
        async move {
            let cancel = CancellationToken::none();
            self.try_acquire_write_with(timeout, &cancel)
                .await?
                .ok_or_else(|| LockError::Timeout(TimeoutValue::from(timeout).elapsed_budget()))
        }
    }

    /// Attempts to acquire a write lock without waiting.
    fn try_acquire_write(
        &self,
    ) -> impl Future<Output = LockResult<Option<Self::WriteHandle>>> + Send {
        async move {
            let cancel = CancellationToken::none();
            self.try_acquire_write_with(Some(Duration::ZERO), &cancel).await
        }
    }
}

// ============================================================================
// Provider Traits
// ============================================================================

/// Factory for creating distributed locks by name.
///
/// Providers encapsulate backend configuration, allowing application code
/// to be backend-agnostic.
///
/// # Example
///
/// ```rust,ignore
/// let provider = PostgresLockProvider::builder()
///     .connection_string(connection_string)
///     .build()?;
///
/// let lock = provider.create_lock("my-resource");
/// let handle = lock.acquire(None).await?;
/// ```
pub trait LockProvider: Send + Sync {
    /// The lock type created by this provider.
    type Lock: DistributedLock;

    /// Creates a lock with the given name.
    fn create_lock(&self, name: &str) -> Self::Lock;
}

/// Factory for creating reader-writer locks by name.
pub trait ReaderWriterLockProvider: Send + Sync {
    /// The lock type created by this provider.
    type Lock: DistributedReaderWriterLock;

    /// Creates a reader-writer lock with the given name.
    fn create_reader_writer_lock(&self, name: &str) -> Self::Lock;
}

// ============================================================================
// Convenience Extensions
// ============================================================================

/// Extension trait providing convenience methods for lock providers.
pub trait LockProviderExt: LockProvider {
    /// Acquires a lock by name, returning the handle.
    ///
    /// Convenience method combining `create_lock` and `acquire`.
    fn acquire_lock(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = LockResult<<Self::Lock as DistributedLock>::Handle>> + Send
    where
        Self: Sync,
    {
        async move {
            let lock = self.create_lock(name);
            lock.acquire(timeout).await
        }
    }

    /// Tries to acquire a lock by name.
    ///
    /// Convenience method combining `create_lock` and `try_acquire`.
    fn try_acquire_lock(
        &self,
        name: &str,
    ) -> impl Future<Output = LockResult<Option<<Self::Lock as DistributedLock>::Handle>>> + Send
    where
        Self: Sync,
    {
        async move {
            let lock = self.create_lock(name);
            lock.try_acquire().await
        }
    }
}

// Blanket implementation for all LockProviders
impl<T: LockProvider> LockProviderExt for T {}
