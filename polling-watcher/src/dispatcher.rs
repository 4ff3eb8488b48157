//! Delivery of change records and fatal errors to observers.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::WatcherError;
use crate::event::ChangeRecord;

/// Callback receiving change records.
pub type ChangeCallback = Arc<dyn Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync>;

/// Callback receiving fatal watcher errors.
pub type ErrorCallback = Arc<dyn Fn(&WatcherError) + Send + Sync>;

/// Handle returned by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Successful callback invocations.
    pub delivered: usize,

    /// Callback invocations that returned an error or panicked.
    pub failed: usize,
}

/// Registry of observers.
///
/// Each dispatch works on a copy of the registry taken when it begins, so
/// subscriptions made during a dispatch apply from the next batch on.
#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    change_observers: RwLock<Vec<(SubscriptionId, ChangeCallback)>>,
    error_observers: RwLock<Vec<(SubscriptionId, ErrorCallback)>>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a change observer.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.change_observers.write().push((id, Arc::new(callback)));
        id
    }

    /// Register a fatal-error observer.
    pub fn subscribe_errors<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&WatcherError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.error_observers.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription of either kind. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut changes = self.change_observers.write();
        let before = changes.len();
        changes.retain(|(existing, _)| *existing != id);
        if changes.len() != before {
            return true;
        }
        drop(changes);

        let mut errors = self.error_observers.write();
        let before = errors.len();
        errors.retain(|(existing, _)| *existing != id);
        errors.len() != before
    }

    /// Number of registered change observers.
    pub fn observer_count(&self) -> usize {
        self.change_observers.read().len()
    }

    /// Deliver records in order to every change observer.
    pub fn dispatch(&self, records: &[ChangeRecord]) -> DispatchReport {
        let mut report = DispatchReport::default();
        if records.is_empty() {
            return report;
        }

        let observers: Vec<(SubscriptionId, ChangeCallback)> = self.change_observers.read().clone();
        for record in records {
            for (id, callback) in &observers {
                match catch_unwind(AssertUnwindSafe(|| callback(record))) {
                    Ok(Ok(())) => report.delivered += 1,
                    Ok(Err(e)) => {
                        report.failed += 1;
                        warn!(
                            "Observer {id:?} failed on {:?} {}: {e:#}",
                            record.kind,
                            record.path.display()
                        );
                    }
                    Err(panic) => {
                        report.failed += 1;
                        warn!(
                            "Observer {id:?} panicked on {:?} {}: {}",
                            record.kind,
                            record.path.display(),
                            panic_message(panic.as_ref())
                        );
                    }
                }
            }
        }

        debug!(
            "Dispatched {} records to {} observers ({} failures)",
            records.len(),
            observers.len(),
            report.failed
        );
        report
    }

    /// Deliver a fatal error to every error observer.
    pub fn dispatch_error(&self, error: &WatcherError) {
        let observers: Vec<(SubscriptionId, ErrorCallback)> = self.error_observers.read().clone();
        for (id, callback) in &observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(error))) {
                warn!(
                    "Error observer {id:?} panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Delivery task fed with one batch per cycle.
pub struct BackgroundDispatch {
    tx: mpsc::Sender<Vec<ChangeRecord>>,
    task: JoinHandle<()>,
}

impl BackgroundDispatch {
    /// Spawn the delivery task on the current runtime.
    pub fn spawn(dispatcher: Arc<Dispatcher>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<ChangeRecord>>(capacity);
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                dispatcher.dispatch(&batch);
            }
        });

        Self { tx, task }
    }

    /// Queue a batch. Waits while the queue is full.
    pub async fn send(&self, records: Vec<ChangeRecord>) {
        if let Err(e) = self.tx.send(records).await {
            warn!("Background dispatch closed, dropped {} records", e.0.len());
        }
    }

    /// Close the queue and wait for queued batches to be delivered.
    pub async fn shutdown(self) {
        let Self { tx, task } = self;
        drop(tx);
        if let Err(e) = task.await {
            warn!("Background dispatch task failed: {e}");
        }
    }
}
