//! Background synchronization worker.
//!
//! Runs a [`KnowledgeSynchronizer`] pass on a polling interval and whenever
//! a [`SyncTrigger`] fires. Triggers arriving while a pass runs collapse
//! into a single follow-up pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::source::DocumentSource;
use crate::sync::KnowledgeSynchronizer;

/// Requests a synchronization pass from a running [`SyncWorker`].
#[derive(Clone)]
pub struct SyncTrigger {
    tx: mpsc::Sender<()>,
}

impl SyncTrigger {
    /// Request a pass. Returns `false` only when the worker has stopped.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

pub struct SyncWorker {
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Spawn the worker. It stops when `cancel` fires.
    ///
    /// With `interval == None` the worker only runs on triggers.
    pub fn spawn(
        synchronizer: Arc<KnowledgeSynchronizer>,
        source: Arc<dyn DocumentSource>,
        interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> (Self, SyncTrigger) {
        // Capacity 1: at most one pending pass is queued behind the running one.
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run(synchronizer, source, interval, rx, cancel));
        (Self { handle }, SyncTrigger { tx })
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "sync worker panicked");
        }
    }
}

async fn run(
    synchronizer: Arc<KnowledgeSynchronizer>,
    source: Arc<dyn DocumentSource>,
    interval: Option<Duration>,
    mut rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    tracing::info!(interval = ?interval, "sync worker started");

    loop {
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(()) = rx.recv() => "trigger",
            _ = next_tick(&mut ticker) => "interval",
        };

        match synchronizer.run(source.as_ref(), &cancel).await {
            Ok(report) => {
                tracing::info!(reason, changes = report.changes(), failed = report.failed.len(), "background sync finished");
            }
            Err(SyncError::Cancelled) => break,
            Err(SyncError::InProgress) => {
                tracing::debug!(reason, "sync already in progress, skipping");
            }
            // Fetch failures are already logged at error level by the pass.
            Err(e) => tracing::warn!(reason, error = %e, "background sync failed"),
        }
    }

    tracing::info!("sync worker stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
