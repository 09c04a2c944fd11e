//! Keepalive and exclusive-use arbitration for one connection.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::session::DatabaseSession;
use crate::cancellation::CancellationToken;
use crate::error::{LockError, LockResult};

enum MonitorState {
    NotStarted,
    Running {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// Cadence requested by the connection plus any active monitoring handles.
struct CadenceRequests {
    base: Option<Duration>,
    active: Vec<(u64, Option<Duration>)>,
    next_id: u64,
}

impl CadenceRequests {
    /// With handles active, the shortest requested cadence wins.
    fn effective(&self) -> Option<Duration> {
        if self.active.is_empty() {
            self.base
        } else {
            self.active.iter().filter_map(|(_, cadence)| *cadence).min()
        }
    }
}

struct Cadence {
    requests: StdMutex<CadenceRequests>,
    sender: watch::Sender<Option<Duration>>,
}

impl Cadence {
    fn requests(&self) -> StdMutexGuard<'_, CadenceRequests> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, change: impl FnOnce(&mut CadenceRequests)) {
        let mut requests = self.requests();
        change(&mut requests);
        let effective = requests.effective();
        self.sender.send_if_modified(|current| {
            let modified = *current != effective;
            *current = effective;
            modified
        });
    }
}

/// Owns the mutex serializing every command on a connection and the
/// background keepalive loop for it.
///
/// Lifecycle is `NotStarted → Running → Stopped`. Once [`stop`](Self::stop)
/// returns, no keepalive probe will run again.
pub struct ConnectionMonitor<S: DatabaseSession> {
    session: Arc<Mutex<S>>,
    cadence: Arc<Cadence>,
    lost: Arc<watch::Sender<bool>>,
    state: StdMutex<MonitorState>,
}

impl<S: DatabaseSession> ConnectionMonitor<S> {
    pub fn new(session: Arc<Mutex<S>>, keepalive_cadence: Option<Duration>) -> Self {
        let (sender, _) = watch::channel(keepalive_cadence);
        let (lost, _) = watch::channel(false);
        Self {
            session,
            cadence: Arc::new(Cadence {
                requests: StdMutex::new(CadenceRequests {
                    base: keepalive_cadence,
                    active: Vec::new(),
                    next_id: 0,
                }),
                sender,
            }),
            lost: Arc::new(lost),
            state: StdMutex::new(MonitorState::NotStarted),
        }
    }

    fn state(&self) -> StdMutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the keepalive loop. Starting a running monitor is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> LockResult<()> {
        let mut state = self.state();
        match *state {
            MonitorState::Running { .. } => Ok(()),
            MonitorState::Stopped => Err(LockError::InvalidOperation(
                "connection monitor has already been stopped".to_string(),
            )),
            MonitorState::NotStarted => {
                let (stop, stop_receiver) = watch::channel(false);
                let task = tokio::spawn(keepalive_loop(
                    Arc::clone(&self.session),
                    self.cadence.sender.subscribe(),
                    stop_receiver,
                    Arc::clone(&self.lost),
                ));
                *state = MonitorState::Running { stop, task };
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state(), MonitorState::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*self.state(), MonitorState::Stopped)
    }

    /// Changes the base cadence. Takes effect on the next loop cycle.
    pub fn set_keepalive_cadence(&self, cadence: Option<Duration>) {
        self.cadence.update(|requests| requests.base = cadence);
    }

    /// The cadence the loop is currently using.
    pub fn keepalive_cadence(&self) -> Option<Duration> {
        *self.cadence.sender.borrow()
    }

    /// Waits for exclusive use of the connection.
    pub async fn acquire_connection_lock(
        &self,
        cancel: &CancellationToken,
    ) -> LockResult<OwnedMutexGuard<S>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            guard = Arc::clone(&self.session).lock_owned() => Ok(guard),
        }
    }

    /// Takes the connection only if nobody else is using it.
    pub fn try_acquire_connection_lock(&self) -> Option<OwnedMutexGuard<S>> {
        Arc::clone(&self.session).try_lock_owned().ok()
    }

    /// Applies `cadence` until the returned handle is dropped.
    ///
    /// While several handles are alive the shortest cadence among them is
    /// used; dropping the last one restores the base cadence.
    pub fn monitoring_handle(&self, cadence: Option<Duration>) -> MonitoringHandle {
        let mut id = 0;
        self.cadence.update(|requests| {
            id = requests.next_id;
            requests.next_id += 1;
            requests.active.push((id, cadence));
        });
        MonitoringHandle {
            cadence: Arc::clone(&self.cadence),
            id,
        }
    }

    /// Receiver that flips to `true` when a probe finds the connection dead.
    pub fn lost_token(&self) -> watch::Receiver<bool> {
        self.lost.subscribe()
    }

    /// Stops the loop and waits for an in-flight probe to finish.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state(), MonitorState::Stopped);
        if let MonitorState::Running { stop, task } = previous {
            stop.send_replace(true);
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("keepalive task panicked: {}", e);
                }
            }
        }
    }
}

impl<S: DatabaseSession> Drop for ConnectionMonitor<S> {
    fn drop(&mut self) {
        // Dropping the stop sender ends the loop at its next await point.
        if let MonitorState::Running { task, .. } =
            std::mem::replace(&mut *self.state(), MonitorState::Stopped)
        {
            drop(task);
        }
    }
}

/// Scoped cadence override returned by [`ConnectionMonitor::monitoring_handle`].
pub struct MonitoringHandle {
    cadence: Arc<Cadence>,
    id: u64,
}

impl Drop for MonitoringHandle {
    fn drop(&mut self) {
        let id = self.id;
        self.cadence
            .update(|requests| requests.active.retain(|(active, _)| *active != id));
    }
}

impl std::fmt::Debug for MonitoringHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringHandle").field("id", &self.id).finish()
    }
}

async fn keepalive_loop<S: DatabaseSession>(
    session: Arc<Mutex<S>>,
    mut cadence: watch::Receiver<Option<Duration>>,
    mut stop: watch::Receiver<bool>,
    lost: Arc<watch::Sender<bool>>,
) {
    loop {
        let current = *cadence.borrow_and_update();
        match current {
            None => {
                tokio::select! {
                    biased;
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    changed = cadence.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
            Some(interval) => {
                tokio::select! {
                    biased;
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = S::sleep(interval) => {}
                }
            }
        }

        let Ok(mut guard) = Arc::clone(&session).try_lock_owned() else {
            trace!("connection busy; skipping keepalive probe");
            continue;
        };
        if !guard.is_open() {
            continue;
        }

        let outcome = tokio::select! {
            biased;
            result = guard.keepalive_probe() => Some(result),
            _ = stop.wait_for(|stopped| *stopped) => None,
        };
        match outcome {
            Some(Ok(())) => trace!("keepalive probe succeeded"),
            Some(Err(e)) if guard.is_open() => {
                debug!("keepalive probe failed on a live connection: {}", e);
            }
            Some(Err(e)) => {
                warn!("keepalive probe found the connection closed: {}", e);
                lost.send_replace(true);
                break;
            }
            None => {
                // The probe was abandoned mid-flight.
                guard.mark_broken();
                break;
            }
        }
    }
}
