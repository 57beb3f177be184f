//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use holo_coord::engine::{Engine, EngineConfig};
use holo_coord::invoke::{BranchCall, BranchInvoker, BranchOutcome};
use holo_coord::model::{TransGlobal, TransStatus, TransType};
use holo_coord::stats::CoordStats;
use holo_coord::store::{KvTransStore, SqlTransStore, TransStore};

/// Upper bound for polling loops.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sql,
    Kv,
}

pub const BACKENDS: [Backend; 2] = [Backend::Sql, Backend::Kv];

/// A store in a private temp directory.
pub struct TestStore {
    pub dir: tempfile::TempDir,
    pub backend: Backend,
    pub store: Arc<dyn TransStore>,
}

impl TestStore {
    pub fn open(backend: Backend) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn TransStore> = match backend {
            Backend::Sql => Arc::new(SqlTransStore::open(&sql_path(dir.path())).expect("open sql")),
            Backend::Kv => Arc::new(KvTransStore::open(&dir.path().join("kv")).expect("open kv")),
        };
        store.populate(true).expect("populate");
        Self {
            dir,
            backend,
            store,
        }
    }

    /// Another handle on the same data, as a second replica would see it.
    /// SQL opens a fresh connection; the fjall keyspace is single-process, so
    /// KV replicas share the handle.
    pub fn replica(&self) -> Arc<dyn TransStore> {
        match self.backend {
            Backend::Sql => {
                Arc::new(SqlTransStore::open(&sql_path(self.dir.path())).expect("open sql replica"))
            }
            Backend::Kv => self.store.clone(),
        }
    }
}

fn sql_path(dir: &Path) -> std::path::PathBuf {
    dir.join("holo_coord.db")
}

/// An active global that is already due and was last touched long ago.
pub fn due_global(gid: &str, trans_type: TransType, status: TransStatus) -> TransGlobal {
    let mut global = TransGlobal::new(gid, trans_type, status);
    global.next_cron_interval = 10;
    global.next_cron_time = 0;
    global.update_time = 0;
    global
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        retry_interval: 10,
        timeout_to_fail: 35,
        max_cron_interval: None,
        update_branch_sync: true,
    }
}

pub fn sync_engine(store: Arc<dyn TransStore>, invoker: Arc<dyn BranchInvoker>) -> Engine {
    Engine::new(
        store,
        invoker,
        None,
        Arc::new(CoordStats::default()),
        engine_config(),
    )
}

/// Scripted answer for one participant call.
#[derive(Debug, Clone)]
pub enum Reply {
    Outcome(BranchOutcome),
    Error(&'static str),
}

pub const SUCCESS: Reply = Reply::Outcome(BranchOutcome::Success);
pub const FAILURE: Reply = Reply::Outcome(BranchOutcome::Failure);
pub const ONGOING: Reply = Reply::Outcome(BranchOutcome::Ongoing);

/// Participant double: answers from per-URL queues and records every call
/// as `url#branch_id#op`.
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, replies: impl IntoIterator<Item = Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn urls_called(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.split('#').next().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl BranchInvoker for ScriptedInvoker {
    async fn invoke(&self, call: BranchCall<'_>) -> anyhow::Result<BranchOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}#{}#{}", call.url, call.branch_id, call.op));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(call.url)
            .and_then(|queue| queue.pop_front());
        match reply {
            Some(Reply::Outcome(outcome)) => Ok(outcome),
            Some(Reply::Error(msg)) => Err(anyhow::anyhow!(msg)),
            None => panic!("unexpected call: {}", call.url),
        }
    }
}

/// Poll `check` until it returns true or [`WAIT_TIMEOUT`] elapses.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Pick an available local TCP port.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
