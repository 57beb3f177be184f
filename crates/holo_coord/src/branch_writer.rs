//! Asynchronous branch-status writer.
//!
//! Workers enqueue branch results on a bounded channel; a single background
//! task coalesces them into batches and applies them with
//! [`TransStore::update_branch_statuses`]. Producers wait when the queue is
//! full, so updates are never dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::model::BranchStatusUpdate;
use crate::stats::CoordStats;
use crate::store::{StoreError, TransStore};

const RETRY_MIN: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct BranchWriterConfig {
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub batch_wait: Duration,
}

/// Producer handle. Cloned into every worker.
#[derive(Clone)]
pub struct BranchWriter {
    tx: mpsc::Sender<BranchStatusUpdate>,
}

/// Owner handle of the consumer task.
pub struct BranchWriterTask {
    close: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BranchWriter {
    /// Start the consumer task. It exits once it is closed (or every handle
    /// is dropped) and the queue is drained, or on a storage invariant
    /// violation.
    pub fn spawn(
        store: Arc<dyn TransStore>,
        stats: Arc<CoordStats>,
        cfg: BranchWriterConfig,
    ) -> (Self, BranchWriterTask) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let (close, close_rx) = watch::channel(false);
        let handle = tokio::spawn(run_writer(store, stats, rx, close_rx, cfg));
        (Self { tx }, BranchWriterTask { close, handle })
    }

    /// Queue one update, waiting for room when the queue is full.
    pub async fn send(&self, update: BranchStatusUpdate) -> anyhow::Result<()> {
        self.tx
            .send(update)
            .await
            .map_err(|_| anyhow!("branch status writer stopped"))
    }
}

impl BranchWriterTask {
    /// Stop accepting updates, write what is already queued, and wait for
    /// the consumer to exit. Producer handles may still be alive.
    pub async fn close(self) {
        let _ = self.close.send(true);
        if let Err(err) = self.handle.await {
            tracing::warn!(error = ?err, "branch writer ended abnormally");
        }
    }
}

async fn run_writer(
    store: Arc<dyn TransStore>,
    stats: Arc<CoordStats>,
    mut rx: mpsc::Receiver<BranchStatusUpdate>,
    mut close: watch::Receiver<bool>,
    cfg: BranchWriterConfig,
) {
    let max_items = cfg.batch_max.max(1);
    let mut closing = false;
    loop {
        let first = tokio::select! {
            biased;
            _ = close.changed(), if !closing => {
                // A dropped task handle closes the writer too.
                closing = true;
                rx.close();
                continue;
            }
            first = rx.recv() => first,
        };
        let Some(first) = first else {
            break;
        };
        let batch = collect_batch(first, &mut rx, max_items, cfg.batch_wait).await;
        if !write_batch(&store, &stats, batch).await {
            // Dropping the receiver fails every waiting and future send.
            return;
        }
    }
    tracing::debug!("branch status writer drained");
}

/// Write one batch, retrying backend errors with backoff. Returns false when
/// the writer must stop.
async fn write_batch(
    store: &Arc<dyn TransStore>,
    stats: &CoordStats,
    mut batch: Vec<BranchStatusUpdate>,
) -> bool {
    let mut delay = RETRY_MIN;
    loop {
        let store = store.clone();
        let job = tokio::task::spawn_blocking(move || {
            let result = store.update_branch_statuses(&batch);
            (batch, result)
        });
        let result = match job.await {
            Ok((returned, result)) => {
                batch = returned;
                result
            }
            Err(err) => {
                tracing::error!(error = ?err, "branch status write task died; writer stopping");
                return false;
            }
        };
        match result {
            Ok(changed) => {
                stats.record_writer_batch(batch.len() as u64);
                tracing::debug!(items = batch.len(), changed, "branch status batch written");
                return true;
            }
            Err(StoreError::Invariant(msg)) => {
                tracing::error!(
                    error = %msg,
                    items = batch.len(),
                    "storage invariant violated; branch status writer stopping"
                );
                return false;
            }
            Err(err) => {
                tracing::warn!(error = ?err, items = batch.len(), "branch status batch failed; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
        }
    }
}

/// Gather up to `max_items` updates, waiting at most `wait` for more to
/// arrive after the first.
async fn collect_batch(
    first: BranchStatusUpdate,
    rx: &mut mpsc::Receiver<BranchStatusUpdate>,
    max_items: usize,
    wait: Duration,
) -> Vec<BranchStatusUpdate> {
    let mut batch = Vec::with_capacity(max_items);
    batch.push(first);

    let deadline = if wait.is_zero() {
        None
    } else {
        Some(Instant::now() + wait)
    };

    'outer: while batch.len() < max_items {
        match rx.try_recv() {
            Ok(update) => {
                batch.push(update);
                continue;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }

        let Some(deadline) = deadline else {
            break;
        };
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(update) => batch.push(update),
                    None => break 'outer,
                }
            }
            _ = tokio::time::sleep(deadline.saturating_duration_since(now)) => {
                break;
            }
        }
    }

    batch
}
