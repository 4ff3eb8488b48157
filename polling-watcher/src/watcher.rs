//! Polling scheduler driving enumeration, diffing and dispatch.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{DispatchMode, WatcherConfig};
use crate::detector::detect_changes;
use crate::dispatcher::{BackgroundDispatch, Dispatcher, SubscriptionId};
use crate::enumerator::Enumerator;
use crate::error::{Result, WatcherError};
use crate::event::ChangeRecord;
use crate::snapshot::DirectoryState;

/// Lifecycle state of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No polling task.
    Stopped,

    /// Polling task active.
    Running,

    /// Stop requested; waiting for the in-flight cycle.
    Stopping,
}

/// Statistics of the most recently published cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    /// Generation of the published state.
    pub generation: u64,

    /// Entries in the published state.
    pub entry_count: usize,

    /// Time spent enumerating and diffing.
    pub duration: Duration,

    /// Transient errors skipped during enumeration.
    pub error_count: u64,

    /// Change records produced.
    pub records_emitted: usize,

    /// Cycles published since construction.
    pub cycles_completed: u64,

    /// When the state was published.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of one requested cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A new state was published.
    Completed(CycleStats),

    /// Another cycle was already running.
    Skipped,

    /// Cancelled during enumeration; nothing was published.
    Cancelled,
}

/// Delay before the next cycle, measured from the start of the last one.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

struct Published {
    state: Arc<DirectoryState>,
    stats: CycleStats,
}

/// Reply slot of a manual cycle serviced by the poll loop.
type ManualPoll = oneshot::Sender<Result<CycleOutcome>>;

struct Lifecycle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    manual: Option<mpsc::UnboundedSender<ManualPoll>>,
}

#[derive(Clone, Copy)]
enum Delivery<'a> {
    /// Publish without diffing or dispatching (baseline).
    Silent,
    Inline,
    Background(&'a BackgroundDispatch),
}

impl<'a> Delivery<'a> {
    fn scheduled(baseline_pending: bool, background: Option<&'a BackgroundDispatch>) -> Self {
        match background {
            _ if baseline_pending => Self::Silent,
            Some(background) => Self::Background(background),
            None => Self::Inline,
        }
    }
}

/// Holds the single-flight flag for the duration of one cycle.
struct CycleGuard<'a>(&'a watch::Sender<bool>);

impl<'a> CycleGuard<'a> {
    fn acquire(busy: &'a watch::Sender<bool>) -> Option<Self> {
        let acquired = busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        acquired.then_some(Self(busy))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

struct Inner {
    config: WatcherConfig,
    enumerator: Arc<Enumerator>,
    dispatcher: Arc<Dispatcher>,
    published: RwLock<Arc<Published>>,
    in_flight: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<WatcherState>,
}

impl Inner {
    fn root(&self) -> &Path {
        self.enumerator.root()
    }

    async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        delivery: Delivery<'_>,
    ) -> Result<CycleOutcome> {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight) else {
            debug!("Cycle already in flight for {}", self.root().display());
            return Ok(CycleOutcome::Skipped);
        };

        let started = Instant::now();
        let observed_at = Utc::now();
        let previous = self.published.read().clone();
        let generation = previous.state.generation() + 1;

        let enumerator = self.enumerator.clone();
        let token = cancel.clone();
        let scanned =
            tokio::task::spawn_blocking(move || enumerator.enumerate(generation, &token)).await??;
        let Some(enumeration) = scanned else {
            return Ok(CycleOutcome::Cancelled);
        };

        let silent = matches!(delivery, Delivery::Silent);
        let records = if silent {
            Vec::new()
        } else {
            detect_changes(&previous.state, &enumeration.state, observed_at)
        };

        let stats = CycleStats {
            generation,
            entry_count: enumeration.state.len(),
            duration: started.elapsed(),
            error_count: enumeration.error_count,
            records_emitted: records.len(),
            cycles_completed: previous.stats.cycles_completed + 1,
            completed_at: Some(Utc::now()),
        };
        drop(previous);

        *self.published.write() = Arc::new(Published {
            state: Arc::new(enumeration.state),
            stats: stats.clone(),
        });

        debug!(
            "Generation {generation}: {} entries, {} changes, {} errors in {:?}{}",
            stats.entry_count,
            stats.records_emitted,
            stats.error_count,
            stats.duration,
            if silent { " (baseline)" } else { "" }
        );

        match delivery {
            Delivery::Silent => {}
            Delivery::Inline => {
                self.dispatcher.dispatch(&records);
            }
            Delivery::Background(background) => background.send(records).await,
        }

        Ok(CycleOutcome::Completed(stats))
    }

    fn finish_after_fatal(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *self.state.borrow() == WatcherState::Running {
            lifecycle.task = None;
            lifecycle.manual = None;
            self.state.send_replace(WatcherState::Stopped);
            info!("Polling watcher stopped itself on {}", self.root().display());
        }
    }

    async fn wait_idle(&self) {
        let mut busy = self.in_flight.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }
}

/// Drives scheduled cycles and services manual cycle requests, so that
/// every cycle of a running watcher goes through the same delivery path.
async fn poll_loop(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    mut manual: mpsc::UnboundedReceiver<ManualPoll>,
) {
    let interval = inner.config.polling_interval;
    let background = match inner.config.dispatch_mode {
        DispatchMode::Inline => None,
        DispatchMode::Background => Some(BackgroundDispatch::spawn(
            inner.dispatcher.clone(),
            inner.config.background_queue_capacity,
        )),
    };
    let span = info_span!("poll_cycle", root = %inner.root().display());

    let mut baseline_pending = inner.config.baseline;
    let mut fatal: Option<(WatcherError, Option<ManualPoll>)> = None;

    'poll: loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let delivery = Delivery::scheduled(baseline_pending, background.as_ref());
        match inner
            .run_cycle(&cancel, delivery)
            .instrument(span.clone())
            .await
        {
            Ok(CycleOutcome::Completed(_)) => baseline_pending = false,
            Ok(CycleOutcome::Skipped) => {}
            Ok(CycleOutcome::Cancelled) => break,
            Err(e) if e.is_fatal() => {
                fatal = Some((e, None));
                break;
            }
            Err(e) => warn!("Poll cycle on {} failed: {e}", inner.root().display()),
        }

        // Manual cycles do not move the schedule.
        let deadline = tokio::time::Instant::now() + next_delay(interval, started.elapsed());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'poll,
                _ = tokio::time::sleep_until(deadline) => break,
                Some(reply) = manual.recv() => {
                    let delivery = Delivery::scheduled(baseline_pending, background.as_ref());
                    let result = inner
                        .run_cycle(&cancel, delivery)
                        .instrument(span.clone())
                        .await;
                    match result {
                        Ok(outcome) => {
                            let cancelled = matches!(outcome, CycleOutcome::Cancelled);
                            if matches!(outcome, CycleOutcome::Completed(_)) {
                                baseline_pending = false;
                            }
                            let _ = reply.send(Ok(outcome));
                            if cancelled {
                                break 'poll;
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            fatal = Some((e, Some(reply)));
                            break 'poll;
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
        }
    }

    // Queued requests see their reply dropped and resolve as cancelled.
    drop(manual);
    if let Some(background) = background {
        background.shutdown().await;
    }

    if let Some((e, reply)) = fatal {
        warn!("Fatal error on {}: {e}", inner.root().display());
        inner.finish_after_fatal();
        inner.dispatcher.dispatch_error(&e);
        if let Some(reply) = reply {
            let _ = reply.send(Err(e));
        }
    }
}

/// A watcher that re-scans a directory tree at a fixed cadence and reports
/// differences between consecutive scans.
///
/// A single enumeration is not time-bounded; a large tree and a short
/// interval make cycles run back to back.
pub struct PollingWatcher {
    inner: Arc<Inner>,
}

impl PollingWatcher {
    /// Create a stopped watcher.
    pub fn new(config: WatcherConfig) -> Result<Self> {
        let enumerator = Enumerator::new(&config)?;
        let empty = DirectoryState::empty(enumerator.case_sensitivity());
        let (state, _) = watch::channel(WatcherState::Stopped);
        let (in_flight, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                enumerator: Arc::new(enumerator),
                dispatcher: Arc::new(Dispatcher::new()),
                published: RwLock::new(Arc::new(Published {
                    state: Arc::new(empty),
                    stats: CycleStats::default(),
                })),
                in_flight,
                lifecycle: Mutex::new(Lifecycle {
                    cancel: CancellationToken::new(),
                    task: None,
                    manual: None,
                }),
                state,
            }),
        })
    }

    /// Spawn the polling task on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let mut lifecycle = self.inner.lifecycle.lock();

        let state = *self.inner.state.borrow();
        match state {
            WatcherState::Running => {
                return Err(WatcherError::AlreadyRunning(self.root().to_path_buf()));
            }
            WatcherState::Stopping => {
                return Err(WatcherError::Stopping(self.root().to_path_buf()));
            }
            WatcherState::Stopped => {}
        }

        let cancel = CancellationToken::new();
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(poll_loop(self.inner.clone(), cancel.clone(), manual_rx));
        lifecycle.cancel = cancel;
        lifecycle.task = Some(task);
        lifecycle.manual = Some(manual_tx);
        self.inner.state.send_replace(WatcherState::Running);

        info!(
            "Polling watcher started on {} every {:?}",
            self.root().display(),
            self.inner.config.polling_interval
        );
        Ok(())
    }

    /// Request a stop and wait for the in-flight cycle, scheduled or manual,
    /// to finish. No records are delivered after this returns.
    pub async fn stop(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        let task = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let state = *self.inner.state.borrow();
            match state {
                WatcherState::Stopped => return Ok(()),
                WatcherState::Stopping => None,
                WatcherState::Running => {
                    self.inner.state.send_replace(WatcherState::Stopping);
                    lifecycle.cancel.cancel();
                    lifecycle.manual = None;
                    lifecycle.task.take()
                }
            }
        };

        let Some(task) = task else {
            // Another caller owns the stop.
            let _ = state_rx
                .wait_for(|state| *state == WatcherState::Stopped)
                .await;
            return Ok(());
        };

        let joined = task.await;
        self.inner.wait_idle().await;
        self.inner.state.send_replace(WatcherState::Stopped);
        info!("Polling watcher stopped on {}", self.root().display());

        joined?;
        Ok(())
    }

    /// Wait until the watcher reaches `Stopped`, including a stop caused by
    /// a fatal error.
    pub async fn stopped(&self) {
        let mut state_rx = self.inner.state.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == WatcherState::Stopped)
            .await;
    }

    /// Run one cycle now.
    ///
    /// On a running watcher the cycle is handed to the poll loop and uses
    /// the configured dispatch mode, so its records queue behind those of
    /// earlier cycles; a fatal error stops the watcher as it would for a
    /// scheduled cycle and is also returned here. While stopping, the
    /// request resolves as [`CycleOutcome::Cancelled`]. On a stopped
    /// watcher the cycle runs on the caller's task and dispatches inline,
    /// and a fatal error is only returned.
    pub async fn poll_now(&self) -> Result<CycleOutcome> {
        let manual = {
            let lifecycle = self.inner.lifecycle.lock();
            match *self.inner.state.borrow() {
                WatcherState::Stopped => None,
                WatcherState::Running | WatcherState::Stopping => Some(lifecycle.manual.clone()),
            }
        };

        let Some(manual) = manual else {
            return self
                .inner
                .run_cycle(&CancellationToken::new(), Delivery::Inline)
                .instrument(info_span!("poll_cycle", root = %self.root().display()))
                .await;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = manual.is_some_and(|manual| manual.send(reply_tx).is_ok());
        if !queued {
            return Ok(CycleOutcome::Cancelled);
        }
        reply_rx.await.unwrap_or(Ok(CycleOutcome::Cancelled))
    }

    /// Register a change observer.
    pub fn on_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(callback)
    }

    /// Register an observer for fatal errors.
    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&WatcherError) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe_errors(callback)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        *self.inner.state.borrow()
    }

    /// Check if the watcher is running.
    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    /// Absolute root of the watched tree.
    pub fn root(&self) -> &Path {
        self.inner.root()
    }

    /// The watcher's configuration.
    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// The most recently published state.
    pub fn snapshot(&self) -> Arc<DirectoryState> {
        self.inner.published.read().state.clone()
    }

    /// Statistics of the most recently published cycle.
    pub fn stats(&self) -> CycleStats {
        self.inner.published.read().stats.clone()
    }

    /// Generation of the most recently published state.
    pub fn current_generation(&self) -> u64 {
        self.inner.published.read().state.generation()
    }

    /// Duration of the most recently published cycle.
    pub fn last_cycle_duration(&self) -> Duration {
        self.inner.published.read().stats.duration
    }

    /// Transient error count of the most recently published cycle.
    pub fn last_cycle_error_count(&self) -> u64 {
        self.inner.published.read().stats.error_count
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.inner.lifecycle.lock().cancel.cancel();
    }
}
