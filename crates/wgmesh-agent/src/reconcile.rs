//! Debounced reconciliation loop.
//!
//! Change notifications open (or extend) a debounce window; when it closes a
//! synchronization pass runs. A failed pass marks the loop dirty and a flat
//! retry timer re-runs it until it succeeds. Passes never overlap.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::error::AgentError;

/// Capacity of the notification channel. Notifications carry no data, so
/// dropping one while the channel is full loses nothing.
pub const NOTIFY_BUFFER: usize = 100;

/// Something the loop can synchronize.
pub trait SyncTarget: Send {
    /// Runs one full synchronization pass.
    fn sync(&mut self) -> impl Future<Output = Result<(), AgentError>> + Send;
}

/// Handle for requesting a synchronization.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<()>,
}

impl Notifier {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }

    /// Requests a pass. Returns false once the loop has stopped.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                trace!("notification channel full, coalescing");
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// What the loop is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for notifications or the retry timer.
    #[default]
    Idle,
    /// Inside a debounce window.
    Coalescing,
    /// A pass is running.
    Syncing,
}

/// Snapshot of the loop's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Current state.
    pub state: LoopState,
    /// The last pass failed and a retry is pending.
    pub dirty: bool,
    /// Passes run so far.
    pub passes: u64,
    /// Passes that failed.
    pub failures: u64,
    /// Message of the most recent failure, cleared on success.
    pub last_error: Option<String>,
}

/// The reconciliation loop.
pub struct Reconciler<T> {
    target: T,
    debounce: Duration,
    retry_interval: Duration,
    notifications: mpsc::Receiver<()>,
    status: watch::Sender<SyncStatus>,
    span: Span,
}

impl<T: SyncTarget> Reconciler<T> {
    /// Creates a loop around `target` and the notifier that feeds it.
    pub fn new(target: T, debounce: Duration, retry_interval: Duration) -> (Self, Notifier) {
        let (tx, notifications) = mpsc::channel(NOTIFY_BUFFER);
        let (status, _) = watch::channel(SyncStatus::default());
        let reconciler = Self {
            target,
            debounce,
            retry_interval,
            notifications,
            status,
            span: tracing::info_span!("reconcile"),
        };
        (reconciler, Notifier { tx })
    }

    /// Logs under `span` instead of a fresh one.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the synchronized target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Subscribes to status updates.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Runs until `shutdown` becomes true or its sender is dropped, then
    /// returns the target. A pass in progress is finished first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> T {
        let span = self.span.clone();
        async move {
            info!(
                debounce_ms = self.debounce.as_millis(),
                retry_ms = self.retry_interval.as_millis(),
                "reconciliation loop started"
            );

            let mut retry = interval_at(Instant::now() + self.retry_interval, self.retry_interval);
            retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut deadline: Option<Instant> = None;
            let mut dirty = false;
            let mut notifications_open = true;

            while !*shutdown.borrow_and_update() {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            debug!("shutdown sender dropped");
                            break;
                        }
                    }

                    msg = self.notifications.recv(), if notifications_open => {
                        if msg.is_some() {
                            trace!("change notification");
                            deadline = Some(Instant::now() + self.debounce);
                            self.set_state(LoopState::Coalescing);
                        } else {
                            warn!("notification channel closed, relying on retries");
                            notifications_open = false;
                        }
                    }

                    () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        dirty = !self.pass().await;
                    }

                    _ = retry.tick() => {
                        if dirty {
                            debug!("retrying failed synchronization");
                            dirty = !self.pass().await;
                            if deadline.is_some() {
                                self.set_state(LoopState::Coalescing);
                            }
                        }
                    }
                }
            }

            info!("reconciliation loop stopped");
            self.target
        }
        .instrument(span)
        .await
    }

    /// Runs one pass and records the outcome. Returns true on success.
    async fn pass(&mut self) -> bool {
        self.set_state(LoopState::Syncing);
        let result = self.target.sync().await;
        let ok = result.is_ok();

        self.status.send_modify(|status| {
            status.state = LoopState::Idle;
            status.passes += 1;
            match &result {
                Ok(()) => {
                    status.dirty = false;
                    status.last_error = None;
                }
                Err(e) => {
                    status.dirty = true;
                    status.failures += 1;
                    status.last_error = Some(e.to_string());
                }
            }
        });

        match result {
            Ok(()) => info!("mesh synchronized"),
            Err(e) => error!(error = %e, stage = e.stage(), "synchronization failed, will retry"),
        }
        ok
    }

    fn set_state(&self, state: LoopState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }
}
