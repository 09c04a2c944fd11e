//! Convenience prelude for distributed lock types.

pub use crate::cancellation::{CancellationSource, CancellationToken};
pub use crate::error::{LockError, LockResult};
pub use crate::executor::{BlockingDistributedLock, BlockingHandle, BlockingReaderWriterLock};
pub use crate::timeout::Timeout;
pub use crate::traits::{
    DistributedLock, DistributedReaderWriterLock, LockHandle, LockMode, LockProvider,
    LockProviderExt, ReaderWriterLockProvider,
};
