//! Cooperative cancellation for lock acquisition.
//!
//! A [`CancellationSource`] owns a `watch` channel; every [`CancellationToken`]
//! cloned from it observes the same flag. A token created with
//! [`CancellationToken::none`] can never fire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Read side of a cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self { receiver: None }
    }

    /// Whether this token can ever be cancelled.
    pub fn can_be_cancelled(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|receiver| *receiver.borrow())
    }

    /// Completes once cancellation is requested.
    ///
    /// Pends forever for [`CancellationToken::none`] and for tokens whose
    /// source was dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(receiver) = &self.receiver else {
            return std::future::pending().await;
        };
        let mut receiver = receiver.clone();
        let source_dropped = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if source_dropped {
            std::future::pending::<()>().await;
        }
    }
}

impl From<watch::Receiver<bool>> for CancellationToken {
    fn from(receiver: watch::Receiver<bool>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }
}

/// Write side of a cancellation signal.
#[derive(Debug)]
pub struct CancellationSource {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken::from(self.sender.subscribe())
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Requests cancellation once `delay` has elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn cancel_after(&self, delay: Duration) {
        let sender = Arc::clone(&self.sender);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sender.send_replace(true);
        });
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
