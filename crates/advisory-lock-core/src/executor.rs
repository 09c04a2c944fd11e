//! Dual-mode execution.
//!
//! Every lock operation is written once as an async function. Blocking callers
//! go through [`run_blocking`], which drives that future to completion on a
//! runtime worker and parks the calling thread until it finishes. The future
//! itself never needs to know which way it was invoked; code that wants to
//! log it can read [`current_mode`].

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::watch;
use tracing::warn;

use crate::cancellation::CancellationToken;
use crate::error::{LockError, LockResult};
use crate::traits::{DistributedLock, DistributedReaderWriterLock, LockHandle};

/// How the current call chain was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Awaited by an async caller.
    Async,
    /// Driven by [`run_blocking`] on behalf of a thread that is parked.
    Blocking,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Blocking => "blocking",
        }
    }
}

tokio::task_local! {
    static MODE: ExecutionMode;
}

/// Returns the execution mode of the current call chain.
///
/// Outside of any [`run_blocking`] scope this is [`ExecutionMode::Async`].
pub fn current_mode() -> ExecutionMode {
    MODE.try_with(|mode| *mode).unwrap_or(ExecutionMode::Async)
}

static BLOCKING_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn blocking_runtime() -> LockResult<&'static Runtime> {
    if let Some(runtime) = BLOCKING_RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("advisory-lock-blocking")
        .enable_all()
        .build()
        .map_err(LockError::backend)?;
    // A racing thread may have won; its runtime is kept and ours is dropped.
    Ok(BLOCKING_RUNTIME.get_or_init(|| runtime))
}

/// The runtime lock resources should be bound to: the current one, or the
/// shared blocking runtime when called from plain synchronous code.
///
/// Constructors that spawn background tasks (connection pools, for example)
/// enter this handle so they work the same from either calling style.
pub fn runtime_handle() -> LockResult<Handle> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => Ok(blocking_runtime()?.handle().clone()),
    }
}

/// Drives `future` to completion, blocking the calling thread.
///
/// * Inside a multi-thread Tokio runtime the worker is handed over with
///   `block_in_place` and the future runs on the same runtime.
/// * Outside of any runtime the future runs on a dedicated, lazily started
///   runtime shared by the whole process.
/// * Inside a current-thread runtime this fails with
///   [`LockError::InvalidOperation`]: the only thread able to make progress
///   would be the one being blocked.
///
/// Errors and cancellation from the future are returned unchanged.
pub fn run_blocking<F, T>(future: F) -> LockResult<T>
where
    F: Future<Output = LockResult<T>>,
{
    if current_mode() == ExecutionMode::Blocking {
        return Err(LockError::InvalidOperation(
            "blocking lock operations cannot be nested inside another blocking operation"
                .to_string(),
        ));
    }

    match Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| {
                handle.block_on(MODE.scope(ExecutionMode::Blocking, future))
            }),
            _ => Err(LockError::InvalidOperation(
                "blocking lock operations require a multi-thread runtime; use the async API"
                    .to_string(),
            )),
        },
        Err(_) => blocking_runtime()?.block_on(MODE.scope(ExecutionMode::Blocking, future)),
    }
}

// ============================================================================
// Blocking Handle
// ============================================================================

/// A lock handle owned by synchronous code.
///
/// Dropping it releases the lock before `drop` returns.
pub struct BlockingHandle<H: LockHandle> {
    inner: Option<H>,
    lost: watch::Receiver<bool>,
}

impl<H: LockHandle> BlockingHandle<H> {
    fn new(inner: H) -> Self {
        let lost = inner.lost_token().clone();
        Self {
            inner: Some(inner),
            lost,
        }
    }

    /// See [`LockHandle::lost_token`].
    pub fn lost_token(&self) -> &watch::Receiver<bool> {
        &self.lost
    }

    /// Whether the connection holding this lock has been reported dead.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Releases the lock, blocking until the release completes.
    pub fn release(mut self) -> LockResult<()> {
        match self.inner.take() {
            Some(handle) => run_blocking(handle.release()),
            None => Ok(()),
        }
    }

    /// Converts back into the async handle.
    pub fn into_async(mut self) -> Option<H> {
        self.inner.take()
    }
}

impl<H: LockHandle> Drop for BlockingHandle<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.take() {
            // On failure the unpolled release future drops `handle`, whose own
            // drop path schedules the release instead.
            if let Err(error) = run_blocking(handle.release()) {
                warn!(%error, "blocking release failed");
            }
        }
    }
}

impl<H: LockHandle> std::fmt::Debug for BlockingHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingHandle")
            .field("released", &self.inner.is_none())
            .field("lost", &*self.lost.borrow())
            .finish()
    }
}

// ============================================================================
// Blocking Extensions
// ============================================================================

/// Blocking entry points for every [`DistributedLock`].
pub trait BlockingDistributedLock: DistributedLock {
    /// Blocking form of [`DistributedLock::try_acquire_with`].
    fn try_acquire_blocking_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<BlockingHandle<Self::Handle>>> {
        Ok(run_blocking(self.try_acquire_with(timeout, cancel))?.map(BlockingHandle::new))
    }

    /// Blocking form of [`DistributedLock::try_acquire`].
    fn try_acquire_blocking(&self) -> LockResult<Option<BlockingHandle<Self::Handle>>> {
        Ok(run_blocking(self.try_acquire())?.map(BlockingHandle::new))
    }

    /// Blocking form of [`DistributedLock::acquire`].
    fn acquire_blocking(
        &self,
        timeout: Option<Duration>,
    ) -> LockResult<BlockingHandle<Self::Handle>> {
        run_blocking(self.acquire(timeout)).map(BlockingHandle::new)
    }

    /// Blocking form of [`DistributedLock::acquire_with`].
    fn acquire_blocking_with(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<BlockingHandle<Self::Handle>> {
        run_blocking(self.acquire_with(timeout, cancel)).map(BlockingHandle::new)
    }
}

impl<T: DistributedLock + ?Sized> BlockingDistributedLock for T {}

/// Blocking entry points for every [`DistributedReaderWriterLock`].
pub trait BlockingReaderWriterLock: DistributedReaderWriterLock {
    fn acquire_read_blocking(
        &self,
        timeout: Option<Duration>,
    ) -> LockResult<BlockingHandle<Self::ReadHandle>> {
        run_blocking(self.acquire_read(timeout)).map(BlockingHandle::new)
    }

    fn try_acquire_read_blocking(&self) -> LockResult<Option<BlockingHandle<Self::ReadHandle>>> {
        Ok(run_blocking(self.try_acquire_read())?.map(BlockingHandle::new))
    }

    fn acquire_write_blocking(
        &self,
        timeout: Option<Duration>,
    ) -> LockResult<BlockingHandle<Self::WriteHandle>> {
        run_blocking(self.acquire_write(timeout)).map(BlockingHandle::new)
    }

    fn try_acquire_write_blocking(
        &self,
    ) -> LockResult<Option<BlockingHandle<Self::WriteHandle>>> {
        Ok(run_blocking(self.try_acquire_write())?.map(BlockingHandle::new))
    }
}

impl<T: DistributedReaderWriterLock + ?Sized> BlockingReaderWriterLock for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_blocking_without_runtime_uses_dedicated_runtime() {
        let (mode, thread) = run_blocking(async {
            Ok((
                current_mode(),
                std::thread::current().name().map(str::to_owned),
            ))
        })
        .unwrap();
        assert_eq!(mode, ExecutionMode::Blocking);
        // block_on polls on the calling thread, not a runtime worker.
        assert_ne!(thread.as_deref(), Some("advisory-lock-blocking"));

        let spawned = run_blocking(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .map_err(LockError::backend)
        })
        .unwrap();
        assert_eq!(spawned.as_deref(), Some("advisory-lock-blocking"));
    }

    #[test]
    fn test_runtime_handle_outside_runtime_spawns_on_blocking_runtime() {
        let handle = runtime_handle().unwrap();
        let name = handle
            .block_on(handle.spawn(async { std::thread::current().name().map(str::to_owned) }))
            .unwrap();
        assert_eq!(name.as_deref(), Some("advisory-lock-blocking"));
    }

    #[tokio::test]
    async fn test_runtime_handle_prefers_current_runtime() {
        let handle = runtime_handle().unwrap();
        assert_eq!(handle.runtime_flavor(), RuntimeFlavor::CurrentThread);
    }

    #[test]
    fn test_run_blocking_propagates_errors() {
        let result: LockResult<()> = run_blocking(async { Err(LockError::Cancelled) });
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_inside_multi_thread_runtime() {
        assert_eq!(current_mode(), ExecutionMode::Async);
        let value = run_blocking(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(current_mode())
        })
        .unwrap();
        assert_eq!(value, ExecutionMode::Blocking);
        assert_eq!(current_mode(), ExecutionMode::Async);
    }

    #[tokio::test]
    async fn test_run_blocking_rejects_current_thread_runtime() {
        let result = run_blocking(async { Ok(()) });
        assert!(matches!(result, Err(LockError::InvalidOperation(_))));
    }

    #[test]
    fn test_nested_run_blocking_is_rejected() {
        let inner = run_blocking(async { Ok(run_blocking(async { Ok(()) })) }).unwrap();
        assert!(matches!(inner, Err(LockError::InvalidOperation(_))));
    }
}
