//! Coordinator configuration.
//!
//! `NodeArgs` is the CLI/env surface; it is converted once into a plain
//! [`CoordConfig`] that is handed to every component at startup.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Backing store selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreDriver {
    Sql,
    Kv,
}

/// CLI options for running a coordinator node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    /// Storage backend: sql (SQLite file) or kv (fjall keyspace).
    #[arg(long, env = "HOLO_COORD_STORE", default_value = "sql")]
    pub store: StoreDriver,

    #[arg(long, env = "HOLO_COORD_DATA_DIR", default_value = "./holo-coord-data")]
    pub data_dir: PathBuf,

    /// Default cron interval (s) when a transaction sets none.
    #[arg(long, env = "HOLO_COORD_RETRY_INTERVAL", default_value_t = 10)]
    pub retry_interval: u64,

    /// Default seconds before an unconfirmed transaction is failed. 0 disables.
    #[arg(long, env = "HOLO_COORD_TIMEOUT_TO_FAIL", default_value_t = 35)]
    pub timeout_to_fail: u64,

    /// Upper bound (s) for exponential cron backoff. Omit for unbounded growth.
    #[arg(long, env = "HOLO_COORD_MAX_CRON_INTERVAL")]
    pub max_cron_interval: Option<u64>,

    /// A claimed transaction is invisible to other replicas for this long (ms).
    #[arg(long, env = "HOLO_COORD_VISIBILITY_WINDOW_MS", default_value_t = 3000)]
    pub visibility_window_ms: u64,

    /// Idle sleep between polls when nothing is due (ms, jittered).
    #[arg(long, env = "HOLO_COORD_CRON_POLL_MS", default_value_t = 3000)]
    pub cron_poll_ms: u64,

    /// Number of recovery workers in this process.
    #[arg(long, env = "HOLO_COORD_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Write every branch status through the global status lock immediately.
    #[arg(long, env = "HOLO_COORD_UPDATE_BRANCH_SYNC", default_value_t = false)]
    pub update_branch_sync: bool,

    /// Capacity of the async branch-status queue. Producers block when full.
    #[arg(long, env = "HOLO_COORD_BRANCH_QUEUE", default_value_t = 1024)]
    pub branch_queue_capacity: usize,

    /// Maximum branch-status updates written per batch.
    #[arg(long, env = "HOLO_COORD_BRANCH_BATCH_MAX", default_value_t = 64)]
    pub branch_batch_max: usize,

    /// Time to wait for a batch to fill (ms). 0 writes whatever is queued.
    #[arg(long, env = "HOLO_COORD_BRANCH_BATCH_WAIT_MS", default_value_t = 20)]
    pub branch_batch_wait_ms: u64,

    /// Timeout for one participant call (ms).
    #[arg(long, env = "HOLO_COORD_REQUEST_TIMEOUT_MS", default_value_t = 3000)]
    pub request_timeout_ms: u64,

    /// Interval between stats log lines (ms). 0 disables.
    #[arg(long, env = "HOLO_COORD_STATS_INTERVAL_MS", default_value_t = 10_000)]
    pub stats_interval_ms: u64,
}

/// CLI options for listing stored transactions.
#[derive(Parser, Debug, Clone)]
pub struct ListArgs {
    #[arg(long, env = "HOLO_COORD_STORE", default_value = "sql")]
    pub store: StoreDriver,

    #[arg(long, env = "HOLO_COORD_DATA_DIR", default_value = "./holo-coord-data")]
    pub data_dir: PathBuf,

    /// Start after this gid.
    #[arg(long)]
    pub after: Option<String>,

    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

impl From<&ListArgs> for CoordConfig {
    fn from(args: &ListArgs) -> Self {
        Self {
            store_driver: args.store,
            data_dir: args.data_dir.clone(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordConfig {
    pub store_driver: StoreDriver,
    pub data_dir: PathBuf,
    /// Seconds.
    pub retry_interval: u64,
    /// Seconds; 0 disables the default timeout.
    pub timeout_to_fail: u64,
    /// Seconds; `None` leaves backoff unbounded.
    pub max_cron_interval: Option<u64>,
    pub visibility_window: Duration,
    pub cron_poll_interval: Duration,
    pub workers: usize,
    pub update_branch_sync: bool,
    pub branch_queue_capacity: usize,
    pub branch_batch_max: usize,
    pub branch_batch_wait: Duration,
    pub request_timeout: Duration,
    pub stats_interval: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            store_driver: StoreDriver::Sql,
            data_dir: PathBuf::from("./holo-coord-data"),
            retry_interval: 10,
            timeout_to_fail: 35,
            max_cron_interval: None,
            visibility_window: Duration::from_secs(3),
            cron_poll_interval: Duration::from_secs(3),
            workers: 1,
            update_branch_sync: false,
            branch_queue_capacity: 1024,
            branch_batch_max: 64,
            branch_batch_wait: Duration::from_millis(20),
            request_timeout: Duration::from_secs(3),
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl From<&NodeArgs> for CoordConfig {
    fn from(args: &NodeArgs) -> Self {
        Self {
            store_driver: args.store,
            data_dir: args.data_dir.clone(),
            retry_interval: args.retry_interval.max(1),
            timeout_to_fail: args.timeout_to_fail,
            max_cron_interval: args.max_cron_interval.filter(|cap| *cap > 0),
            visibility_window: Duration::from_millis(args.visibility_window_ms),
            cron_poll_interval: Duration::from_millis(args.cron_poll_ms.max(1)),
            workers: args.workers.max(1),
            update_branch_sync: args.update_branch_sync,
            branch_queue_capacity: args.branch_queue_capacity.max(1),
            branch_batch_max: args.branch_batch_max.max(1),
            branch_batch_wait: Duration::from_millis(args.branch_batch_wait_ms),
            request_timeout: Duration::from_millis(args.request_timeout_ms.max(1)),
            stats_interval: Duration::from_millis(args.stats_interval_ms),
        }
    }
}
