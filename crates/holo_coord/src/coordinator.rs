//! Client-facing transaction operations.
//!
//! The [`Coordinator`] owns the engine and is what an HTTP or gRPC front end
//! would call. Duplicate requests are idempotent: re-sending a create for a
//! transaction that is already in the requested (or a later) state succeeds.

use std::sync::{Arc, OnceLock};

use anyhow::Context;
use tokio::sync::broadcast;

use crate::engine::{is_lost_race, Engine, Trans};
use crate::model::{
    unix_time_ms, Protocol, TransBranch, TransGlobal, TransOptions, TransStatus, TransType,
};
use crate::store::{next_cron_time, StoreError};

const PROCESSED_CHANNEL: usize = 1024;

/// A new global transaction as submitted by a client.
#[derive(Debug, Clone)]
pub struct TransRequest {
    pub gid: String,
    pub trans_type: TransType,
    pub protocol: Protocol,
    pub query_prepared: String,
    pub options: TransOptions,
    pub custom_data: String,
    pub branches: Vec<TransBranch>,
}

impl TransRequest {
    pub fn new(gid: impl Into<String>, trans_type: TransType) -> Self {
        Self {
            gid: gid.into(),
            trans_type,
            protocol: Protocol::Http,
            query_prepared: String::new(),
            options: TransOptions::default(),
            custom_data: String::new(),
            branches: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: TransBranch) -> Self {
        self.branches.push(branch);
        self
    }
}

pub struct Coordinator {
    engine: Arc<Engine>,
    processed: broadcast::Sender<String>,
}

impl Coordinator {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (processed, _) = broadcast::channel(PROCESSED_CHANNEL);
        Self { engine, processed }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Sender the scheduler publishes processed gids on.
    pub fn processed_sender(&self) -> broadcast::Sender<String> {
        self.processed.clone()
    }

    /// Gids of transactions after each processing cycle, inline or by cron.
    pub fn subscribe_processed(&self) -> broadcast::Receiver<String> {
        self.processed.subscribe()
    }

    /// Register a transaction that waits for an explicit submit or abort.
    pub fn prepare(&self, req: TransRequest) -> anyhow::Result<TransGlobal> {
        let (global, branches) = self.build(req, TransStatus::Prepared);
        match self.engine.store().save_new_trans(&global, &branches) {
            Ok(()) => {
                tracing::info!(gid = %global.gid, trans_type = %global.trans_type, "transaction prepared");
                Ok(global)
            }
            Err(StoreError::UniqueConflict) => {
                let existing = self.engine.store().get_trans_global(&global.gid)?;
                if existing.status != TransStatus::Prepared || existing.trans_type != global.trans_type {
                    anyhow::bail!(
                        "transaction {} already exists with status {}",
                        existing.gid,
                        existing.status
                    );
                }
                Ok(existing)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create a submitted transaction, or submit a prepared one. Branches
    /// carried by the request are added to an existing prepared transaction.
    /// Returns the status after inline processing when `wait_result` is set.
    pub async fn submit(&self, req: TransRequest) -> anyhow::Result<TransStatus> {
        let wait_result = req.options.wait_result;
        let (global, branches) = self.build(req, TransStatus::Submitted);
        let gid = global.gid.clone();
        let trans = match self.engine.store().save_new_trans(&global, &branches) {
            Ok(()) => Trans::new(global, branches),
            Err(StoreError::UniqueConflict) => {
                let mut trans = self.engine.load(&gid)?;
                match trans.global.status {
                    TransStatus::Prepared => {
                        if !branches.is_empty() {
                            self.engine
                                .store()
                                .lock_global_save_branches(&gid, TransStatus::Prepared, &branches)
                                .with_context(|| format!("transaction {gid} left prepared state"))?;
                            trans = self.engine.load(&gid)?;
                        }
                        self.engine
                            .change_status(&mut trans, TransStatus::Submitted)
                            .with_context(|| format!("submit {gid}"))?;
                        trans
                    }
                    TransStatus::Submitted | TransStatus::Succeed => {
                        return Ok(trans.global.status);
                    }
                    status => anyhow::bail!("transaction {gid} cannot be submitted from {status}"),
                }
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(gid = %gid, "transaction submitted");
        self.drive(trans, wait_result).await
    }

    /// Roll back a prepared transaction.
    pub async fn abort(&self, gid: &str) -> anyhow::Result<TransStatus> {
        let mut trans = self.engine.load(gid).map_err(|err| match err {
            StoreError::NotFound => anyhow::anyhow!("transaction {gid} not found"),
            other => other.into(),
        })?;
        match trans.global.status {
            TransStatus::Prepared => {}
            TransStatus::Aborting | TransStatus::Failed => return Ok(trans.global.status),
            status => anyhow::bail!("transaction {gid} cannot be aborted from {status}"),
        }
        if trans.global.trans_type == TransType::Msg {
            self.engine.change_status(&mut trans, TransStatus::Failed)?;
            return Ok(TransStatus::Failed);
        }
        self.engine
            .change_status(&mut trans, TransStatus::Aborting)
            .with_context(|| format!("abort {gid}"))?;
        let wait_result = trans.global.options.wait_result;
        self.drive(trans, wait_result).await
    }

    /// Add branches to a transaction that is still prepared.
    pub fn register_branch(&self, gid: &str, branches: Vec<TransBranch>) -> anyhow::Result<()> {
        let branches: Vec<TransBranch> = branches
            .into_iter()
            .map(|mut branch| {
                branch.gid = gid.to_string();
                branch
            })
            .collect();
        match self
            .engine
            .store()
            .lock_global_save_branches(gid, TransStatus::Prepared, &branches)
        {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => {
                anyhow::bail!("transaction {gid} not found or no longer prepared")
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn query(&self, gid: &str) -> anyhow::Result<(TransGlobal, Vec<TransBranch>)> {
        let trans = self.engine.load(gid)?;
        Ok((trans.global, trans.branches))
    }

    pub fn list(&self, cursor: &mut Option<String>, limit: usize) -> anyhow::Result<Vec<TransGlobal>> {
        Ok(self.engine.store().scan_trans_globals(cursor, limit)?)
    }

    fn build(&self, req: TransRequest, status: TransStatus) -> (TransGlobal, Vec<TransBranch>) {
        let mut global = TransGlobal::new(req.gid, req.trans_type, status);
        global.protocol = req.protocol;
        global.query_prepared = req.query_prepared;
        global.options = req.options;
        global.custom_data = req.custom_data;
        let now = unix_time_ms();
        global.next_cron_interval = self.engine.cron_policy(&global).baseline;
        global.next_cron_time = next_cron_time(now, global.next_cron_interval);
        if status == TransStatus::Submitted {
            global.commit_time = Some(now);
        }
        let branches = req
            .branches
            .into_iter()
            .map(|mut branch| {
                branch.gid = global.gid.clone();
                branch
            })
            .collect();
        (global, branches)
    }

    /// Process inline and report the outcome, or hand the transaction to a
    /// background task and report the current status.
    async fn drive(&self, mut trans: Trans, wait_result: bool) -> anyhow::Result<TransStatus> {
        if !wait_result {
            let status = trans.global.status;
            let engine = self.engine.clone();
            let processed = self.processed.clone();
            tokio::spawn(async move {
                let gid = trans.global.gid.clone();
                if let Err(err) = engine.process(&mut trans).await {
                    if is_lost_race(&err) {
                        tracing::debug!(gid = %gid, "transaction changed by another party");
                    } else {
                        tracing::warn!(gid = %gid, error = ?err, "inline processing failed; cron will retry");
                    }
                }
                let _ = processed.send(gid);
            });
            return Ok(status);
        }

        trans.update_branch_sync = true;
        let gid = trans.global.gid.clone();
        let result = self.engine.process(&mut trans).await;
        let _ = self.processed.send(gid.clone());
        match result {
            Ok(()) => Ok(trans.global.status),
            Err(err) if is_lost_race(&err) => Ok(self.engine.store().get_trans_global(&gid)?.status),
            Err(err) => Err(err),
        }
    }
}

/// New globally unique transaction id: a per-process prefix and a random UUID.
pub fn gen_gid() -> String {
    static NODE_PREFIX: OnceLock<String> = OnceLock::new();
    let prefix = NODE_PREFIX.get_or_init(|| {
        let mut node = uuid::Uuid::new_v4().simple().to_string();
        node.truncate(8);
        node
    });
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}
