//! Durable transaction storage.
//!
//! Every backend implements [`TransStore`]. The engine and scheduler only see
//! the trait object returned by [`open_store`], so the backend is chosen once
//! at startup.
//!
//! All cross-replica coordination happens here: global status changes are
//! compare-and-swap on the previous status, branch writes are guarded by the
//! expected global status, and [`TransStore::lock_one_global_trans`] hands out
//! timestamp leases instead of relying on a lock service.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{CoordConfig, StoreDriver};
use crate::model::{BranchStatusUpdate, TransBranch, TransGlobal, TransStatus};

pub mod kv;
pub mod sql;

pub use kv::KvTransStore;
pub use sql::SqlTransStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row absent, or a compare-and-swap precondition did not hold.
    #[error("storage: not found")]
    NotFound,
    /// A transaction with the same gid already exists.
    #[error("storage: unique key conflict")]
    UniqueConflict,
    /// A write expected to touch exactly one row touched none for an unknown reason.
    #[error("storage invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Kv(#[from] fjall::Error),
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Auxiliary columns persisted alongside a global status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalField {
    NextCron,
    CommitTime,
    FinishTime,
    RollbackTime,
}

pub trait TransStore: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create tables/partitions; unless `skip_drop`, wipe existing data first.
    fn populate(&self, skip_drop: bool) -> StoreResult<()>;

    /// Insert a global row and its branches iff the gid is new.
    fn save_new_trans(&self, global: &TransGlobal, branches: &[TransBranch]) -> StoreResult<()>;

    fn get_trans_global(&self, gid: &str) -> StoreResult<TransGlobal>;

    /// Page of transactions ordered by gid. `cursor` is the last gid of the
    /// previous page and is advanced past the returned rows. An empty page
    /// means the scan is exhausted.
    fn scan_trans_globals(
        &self,
        cursor: &mut Option<String>,
        limit: usize,
    ) -> StoreResult<Vec<TransGlobal>>;

    /// Branches of `gid` in creation order.
    fn get_branches(&self, gid: &str) -> StoreResult<Vec<TransBranch>>;

    /// Apply branch status changes without checking the global status.
    /// Only branches still `prepared` change. Returns the number updated.
    fn update_branch_statuses(&self, updates: &[BranchStatusUpdate]) -> StoreResult<usize>;

    /// If the global is currently `expected`, append new branches and update
    /// existing ones (terminal branches are left untouched). Otherwise
    /// `NotFound` and nothing changes.
    fn lock_global_save_branches(
        &self,
        gid: &str,
        expected: TransStatus,
        branches: &[TransBranch],
    ) -> StoreResult<()>;

    /// Compare-and-swap `global.status` to `new_status`, persisting `fields`.
    /// On success the in-memory copy carries the new status. `finished`
    /// removes the row from the due index and is only valid with a terminal
    /// status; anything else is rejected as [`StoreError::Invariant`].
    fn change_global_status(
        &self,
        global: &mut TransGlobal,
        new_status: TransStatus,
        fields: &[GlobalField],
        finished: bool,
    ) -> StoreResult<()>;

    /// Reschedule the next cron check `next_interval` seconds from now.
    fn touch_cron_time(&self, global: &mut TransGlobal, next_interval: u64) -> StoreResult<()>;

    /// Claim the earliest due active transaction not touched within
    /// `visibility`, stamping a fresh owner token. `NotFound` when nothing is due.
    fn lock_one_global_trans(&self, visibility: Duration) -> StoreResult<TransGlobal>;
}

/// Open the backend selected by configuration.
pub fn open_store(cfg: &CoordConfig) -> anyhow::Result<Arc<dyn TransStore>> {
    std::fs::create_dir_all(&cfg.data_dir)?;
    let store: Arc<dyn TransStore> = match cfg.store_driver {
        StoreDriver::Sql => Arc::new(SqlTransStore::open(&cfg.data_dir.join("holo_coord.db"))?),
        StoreDriver::Kv => Arc::new(KvTransStore::open(&cfg.data_dir.join("kv"))?),
    };
    store.populate(true)?;
    tracing::info!(backend = store.name(), data_dir = %cfg.data_dir.display(), "transaction store opened");
    Ok(store)
}

/// Next cron time for an interval in seconds starting at `now_ms`.
pub(crate) fn next_cron_time(now_ms: u64, interval_secs: u64) -> u64 {
    now_ms.saturating_add(interval_secs.saturating_mul(1000))
}

/// `finished` is only meaningful for a terminal status.
pub(crate) fn check_finished(gid: &str, new_status: TransStatus, finished: bool) -> StoreResult<()> {
    if finished && !new_status.is_terminal() {
        return Err(StoreError::Invariant(format!(
            "gid {gid} marked finished with non-terminal status {new_status}"
        )));
    }
    Ok(())
}
