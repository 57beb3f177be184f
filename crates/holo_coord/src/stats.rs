//! Process-local coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared by the engine, the scheduler and the branch writer.
#[derive(Default)]
pub struct CoordStats {
    branch_succeed: AtomicU64,
    branch_failed: AtomicU64,
    branch_ongoing: AtomicU64,
    branch_errors: AtomicU64,
    cron_cycles: AtomicU64,
    cron_claims: AtomicU64,
    cron_lost_races: AtomicU64,
    trans_finished: AtomicU64,
    writer_batches: AtomicU64,
    writer_items: AtomicU64,
    writer_max_items: AtomicU64,
}

/// Snapshot of coordinator counters.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CoordStatsSnapshot {
    pub branch_succeed: u64,
    pub branch_failed: u64,
    pub branch_ongoing: u64,
    pub branch_errors: u64,
    pub cron_cycles: u64,
    pub cron_claims: u64,
    pub cron_lost_races: u64,
    pub trans_finished: u64,
    pub writer_batches: u64,
    pub writer_items: u64,
    pub writer_max_items: u64,
}

impl CoordStats {
    pub fn record_branch_succeed(&self) {
        self.branch_succeed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_branch_failed(&self) {
        self.branch_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_branch_ongoing(&self) {
        self.branch_ongoing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_branch_error(&self) {
        self.branch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one scheduler poll; `claimed` when it won a transaction.
    pub fn record_cron_cycle(&self, claimed: bool) {
        self.cron_cycles.fetch_add(1, Ordering::Relaxed);
        if claimed {
            self.cron_claims.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lost_race(&self) {
        self.cron_lost_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trans_finished(&self) {
        self.trans_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a branch-status batch written by the async writer.
    pub fn record_writer_batch(&self, items: u64) {
        self.writer_batches.fetch_add(1, Ordering::Relaxed);
        self.writer_items.fetch_add(items, Ordering::Relaxed);
        self.writer_max_items.fetch_max(items, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> CoordStatsSnapshot {
        CoordStatsSnapshot {
            branch_succeed: self.branch_succeed.swap(0, Ordering::Relaxed),
            branch_failed: self.branch_failed.swap(0, Ordering::Relaxed),
            branch_ongoing: self.branch_ongoing.swap(0, Ordering::Relaxed),
            branch_errors: self.branch_errors.swap(0, Ordering::Relaxed),
            cron_cycles: self.cron_cycles.swap(0, Ordering::Relaxed),
            cron_claims: self.cron_claims.swap(0, Ordering::Relaxed),
            cron_lost_races: self.cron_lost_races.swap(0, Ordering::Relaxed),
            trans_finished: self.trans_finished.swap(0, Ordering::Relaxed),
            writer_batches: self.writer_batches.swap(0, Ordering::Relaxed),
            writer_items: self.writer_items.swap(0, Ordering::Relaxed),
            writer_max_items: self.writer_max_items.swap(0, Ordering::Relaxed),
        }
    }
}

/// Log a stats line every `interval` until the task is aborted.
pub fn spawn_stats_logger(stats: Arc<CoordStats>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snap = stats.snapshot_and_reset();
            tracing::info!(
                branch_succeed = snap.branch_succeed,
                branch_failed = snap.branch_failed,
                branch_ongoing = snap.branch_ongoing,
                branch_errors = snap.branch_errors,
                cron_cycles = snap.cron_cycles,
                cron_claims = snap.cron_claims,
                cron_lost_races = snap.cron_lost_races,
                trans_finished = snap.trans_finished,
                writer_batches = snap.writer_batches,
                writer_items = snap.writer_items,
                writer_max_items = snap.writer_max_items,
                "coordinator stats"
            );
        }
    })
}
