//! Global transaction engine.
//!
//! A [`Trans`] is the in-memory copy of one transaction for the length of a
//! processing cycle. Nothing in it is authoritative: every status change goes
//! through a compare-and-swap in the store, and a lost race surfaces as
//! [`StoreError::NotFound`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use crate::branch_writer::BranchWriter;
use crate::config::CoordConfig;
use crate::cron::{CronPolicy, CronType, RESET_AFTER};
use crate::invoke::{BranchCall, BranchInvoker, BranchOutcome};
use crate::model::{
    unix_time_ms, BranchOp, BranchStatus, BranchStatusUpdate, TransBranch, TransGlobal,
    TransStatus, TransType, MSG_QUERY_BRANCH_ID,
};
use crate::stats::CoordStats;
use crate::store::{next_cron_time, GlobalField, StoreError, StoreResult, TransStore};

mod processor;

/// Node-wide defaults the engine falls back to when a transaction sets none.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub retry_interval: u64,
    pub timeout_to_fail: u64,
    pub max_cron_interval: Option<u64>,
    pub update_branch_sync: bool,
}

impl From<&CoordConfig> for EngineConfig {
    fn from(cfg: &CoordConfig) -> Self {
        Self {
            retry_interval: cfg.retry_interval,
            timeout_to_fail: cfg.timeout_to_fail,
            max_cron_interval: cfg.max_cron_interval,
            update_branch_sync: cfg.update_branch_sync,
        }
    }
}

/// Result of one branch call once its answer has been interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchProgress {
    Succeed,
    Failed,
    Ongoing,
}

/// One transaction loaded for a processing cycle.
#[derive(Debug, Clone)]
pub struct Trans {
    pub global: TransGlobal,
    pub branches: Vec<TransBranch>,
    /// Write branch statuses through the global lock even when the node
    /// uses the async writer.
    pub update_branch_sync: bool,
    last_touched: Instant,
    touched: bool,
}

impl Trans {
    pub fn new(global: TransGlobal, branches: Vec<TransBranch>) -> Self {
        Self {
            global,
            branches,
            update_branch_sync: false,
            last_touched: Instant::now(),
            touched: false,
        }
    }

    /// Whether the cron schedule was rewritten during this cycle.
    pub fn touched(&self) -> bool {
        self.touched
    }

    pub fn branch_index(&self, branch_id: &str, op: BranchOp) -> Option<usize> {
        self.branches
            .iter()
            .position(|b| b.branch_id == branch_id && b.op == op)
    }

    fn indices_of(&self, op: BranchOp) -> Vec<usize> {
        self.branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.op == op)
            .map(|(idx, _)| idx)
            .collect()
    }
}

pub struct Engine {
    store: Arc<dyn TransStore>,
    invoker: Arc<dyn BranchInvoker>,
    branch_writer: Option<BranchWriter>,
    stats: Arc<CoordStats>,
    cfg: EngineConfig,
}

impl Engine {
    /// Without a `branch_writer` every branch status is written synchronously.
    pub fn new(
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
        branch_writer: Option<BranchWriter>,
        stats: Arc<CoordStats>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            branch_writer,
            stats,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<CoordStats> {
        &self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn cron_policy(&self, global: &TransGlobal) -> CronPolicy {
        let baseline = if global.options.retry_interval != 0 {
            global.options.retry_interval
        } else {
            self.cfg.retry_interval
        };
        CronPolicy::new(baseline, self.cfg.max_cron_interval)
    }

    /// A transaction times out `timeout_to_fail` seconds after creation.
    /// Sagas only time out when they set their own timeout.
    pub fn is_timeout(&self, global: &TransGlobal, now_ms: u64) -> bool {
        let mut timeout = global.options.timeout_to_fail;
        if timeout == 0 && global.trans_type != TransType::Saga {
            timeout = self.cfg.timeout_to_fail;
        }
        if timeout == 0 {
            return false;
        }
        now_ms.saturating_sub(global.create_time) >= timeout.saturating_mul(1000)
    }

    pub fn need_process(&self, global: &TransGlobal, now_ms: u64) -> bool {
        match global.status {
            TransStatus::Submitted | TransStatus::Aborting => true,
            TransStatus::Prepared => self.is_timeout(global, now_ms),
            TransStatus::Succeed | TransStatus::Failed => false,
        }
    }

    pub fn load(&self, gid: &str) -> StoreResult<Trans> {
        let global = self.store.get_trans_global(gid)?;
        self.attach_branches(global)
    }

    /// Wrap a claimed global with its current branches.
    pub fn attach_branches(&self, global: TransGlobal) -> StoreResult<Trans> {
        let branches = self.store.get_branches(&global.gid)?;
        Ok(Trans::new(global, branches))
    }

    /// Advance the transaction as far as its participants allow.
    pub async fn process(&self, trans: &mut Trans) -> anyhow::Result<()> {
        if !self.need_process(&trans.global, unix_time_ms()) {
            return Ok(());
        }
        match trans.global.trans_type {
            TransType::Saga => self.process_saga(trans).await,
            TransType::Tcc => {
                self.process_two_phase(trans, BranchOp::Confirm, BranchOp::Cancel)
                    .await
            }
            TransType::Xa => {
                self.process_two_phase(trans, BranchOp::Commit, BranchOp::Rollback)
                    .await
            }
            TransType::Msg => self.process_msg(trans).await,
        }
    }

    /// Rewrite the cron schedule according to `cron_type`.
    pub fn touch(&self, trans: &mut Trans, cron_type: CronType) -> StoreResult<()> {
        let next = self
            .cron_policy(&trans.global)
            .next_interval(trans.global.next_cron_interval, cron_type);
        self.store.touch_cron_time(&mut trans.global, next)?;
        trans.last_touched = Instant::now();
        trans.touched = true;
        tracing::debug!(
            gid = %trans.global.gid,
            ?cron_type,
            next_cron_interval = next,
            "cron touched"
        );
        Ok(())
    }

    /// Compare-and-swap the global status, resetting its cron schedule and
    /// stamping the matching timestamp.
    pub fn change_status(&self, trans: &mut Trans, new_status: TransStatus) -> StoreResult<()> {
        let now = unix_time_ms();
        let global = &mut trans.global;
        let interval = self
            .cron_policy(global)
            .next_interval(global.next_cron_interval, CronType::Reset);
        global.next_cron_interval = interval;
        global.next_cron_time = next_cron_time(now, interval);

        let mut fields = vec![GlobalField::NextCron];
        match new_status {
            TransStatus::Submitted => {
                global.commit_time = Some(now);
                fields.push(GlobalField::CommitTime);
            }
            TransStatus::Succeed => {
                global.finish_time = Some(now);
                fields.push(GlobalField::FinishTime);
            }
            TransStatus::Failed => {
                global.rollback_time = Some(now);
                fields.push(GlobalField::RollbackTime);
            }
            TransStatus::Prepared | TransStatus::Aborting => {}
        }
        let old_status = global.status;
        let finished = new_status.is_terminal();
        self.store
            .change_global_status(global, new_status, &fields, finished)?;
        trans.last_touched = Instant::now();
        trans.touched = true;
        if finished {
            self.stats.record_trans_finished();
        }
        tracing::info!(
            gid = %trans.global.gid,
            from = %old_status,
            to = %new_status,
            "transaction status changed"
        );
        Ok(())
    }

    /// Record a branch result, synchronously under the global status lock or
    /// through the async writer.
    pub async fn change_branch_status(
        &self,
        trans: &mut Trans,
        idx: usize,
        status: BranchStatus,
    ) -> anyhow::Result<()> {
        let now = unix_time_ms();
        let branch = &mut trans.branches[idx];
        branch.status = status;
        branch.finish_time = Some(now);
        branch.update_time = now;

        let writer = match &self.branch_writer {
            Some(writer) if !self.cfg.update_branch_sync && !trans.update_branch_sync => writer,
            _ => {
                let store = self.store.clone();
                let gid = trans.global.gid.clone();
                let expected = trans.global.status;
                let branch = branch.clone();
                tokio::task::spawn_blocking(move || {
                    store.lock_global_save_branches(&gid, expected, std::slice::from_ref(&branch))
                })
                .await
                .context("branch status write task")??;
                return Ok(());
            }
        };
        writer
            .send(BranchStatusUpdate {
                gid: branch.gid.clone(),
                branch_id: branch.branch_id.clone(),
                op: branch.op,
                status,
                finish_time: now,
            })
            .await
    }

    /// Call one branch, record its status, and adjust the cron schedule.
    pub async fn exec_branch(&self, trans: &mut Trans, idx: usize) -> anyhow::Result<BranchProgress> {
        let outcome = {
            let branch = &trans.branches[idx];
            let call = BranchCall {
                protocol: trans.global.protocol,
                url: &branch.url,
                gid: &trans.global.gid,
                trans_type: trans.global.trans_type,
                branch_id: &branch.branch_id,
                op: branch.op,
                payload: &branch.bin_data,
                headers: &trans.global.options.branch_headers,
            };
            self.invoker.invoke(call).await
        };
        let op = trans.branches[idx].op;
        let progress = match outcome {
            Ok(BranchOutcome::Success) => Ok(BranchProgress::Succeed),
            Ok(BranchOutcome::Failure)
                if trans.global.trans_type == TransType::Saga && op == BranchOp::Action =>
            {
                Ok(BranchProgress::Failed)
            }
            Ok(BranchOutcome::Failure) => Err(anyhow::anyhow!(
                "participant returned FAILURE for {} branch {} of {} transaction",
                op,
                trans.branches[idx].branch_id,
                trans.global.trans_type
            )),
            Ok(BranchOutcome::Ongoing) => Ok(BranchProgress::Ongoing),
            Err(err) => Err(err),
        };

        match &progress {
            Ok(BranchProgress::Succeed) => {
                self.stats.record_branch_succeed();
                self.change_branch_status(trans, idx, BranchStatus::Succeed).await?;
            }
            Ok(BranchProgress::Failed) => {
                self.stats.record_branch_failed();
                self.change_branch_status(trans, idx, BranchStatus::Failed).await?;
            }
            Ok(BranchProgress::Ongoing) => self.stats.record_branch_ongoing(),
            Err(err) => {
                self.stats.record_branch_error();
                tracing::warn!(
                    gid = %trans.global.gid,
                    branch_id = %trans.branches[idx].branch_id,
                    %op,
                    error = ?err,
                    "branch call failed"
                );
            }
        }

        let cron_type = match &progress {
            Ok(BranchProgress::Ongoing) => Some(CronType::Keep),
            Ok(_) if self.should_reset(trans) => Some(CronType::Reset),
            Ok(_) => None,
            Err(_) => Some(CronType::Backoff),
        };
        if let Some(cron_type) = cron_type {
            self.touch(trans, cron_type)?;
        }
        progress
    }

    /// Ask a message transaction's `query_prepared` endpoint whether the
    /// local transaction committed.
    pub async fn query_prepared(&self, trans: &Trans) -> anyhow::Result<BranchOutcome> {
        let call = BranchCall {
            protocol: trans.global.protocol,
            url: &trans.global.query_prepared,
            gid: &trans.global.gid,
            trans_type: trans.global.trans_type,
            branch_id: MSG_QUERY_BRANCH_ID,
            op: BranchOp::Msg,
            payload: &[],
            headers: &trans.global.options.branch_headers,
        };
        self.invoker.invoke(call).await
    }

    /// Progress resets the cron interval once enough time has passed since
    /// the last touch, or when earlier errors left it above baseline.
    fn should_reset(&self, trans: &Trans) -> bool {
        trans.last_touched.elapsed() >= RESET_AFTER
            || trans.global.next_cron_interval > self.cron_policy(&trans.global).baseline
    }
}

/// Lost the race for this transaction to another replica or a client call.
pub fn is_lost_race(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound))
}

/// A storage invariant was violated; the cycle must stop loudly.
pub fn is_invariant_violation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Invariant(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransOptions;
    use crate::store::SqlTransStore;
    use async_trait::async_trait;

    struct NoCalls;

    #[async_trait]
    impl BranchInvoker for NoCalls {
        async fn invoke(&self, call: BranchCall<'_>) -> anyhow::Result<BranchOutcome> {
            panic!("unexpected call: {}", call.url);
        }
    }

    fn engine(cfg: EngineConfig) -> Engine {
        let store: Arc<dyn TransStore> = Arc::new(SqlTransStore::open_in_memory().unwrap());
        Engine::new(store, Arc::new(NoCalls), None, Arc::new(CoordStats::default()), cfg)
    }

    fn defaults() -> EngineConfig {
        EngineConfig {
            retry_interval: 10,
            timeout_to_fail: 35,
            max_cron_interval: None,
            update_branch_sync: false,
        }
    }

    #[test]
    fn saga_only_times_out_with_its_own_timeout() {
        let engine = engine(defaults());
        let mut saga = TransGlobal::new("s", TransType::Saga, TransStatus::Prepared);
        saga.create_time = 0;
        assert!(!engine.is_timeout(&saga, 1_000_000));
        saga.options = TransOptions {
            timeout_to_fail: 5,
            ..TransOptions::default()
        };
        assert!(engine.is_timeout(&saga, 5_000));
        assert!(!engine.is_timeout(&saga, 4_999));

        let mut tcc = TransGlobal::new("t", TransType::Tcc, TransStatus::Prepared);
        tcc.create_time = 0;
        assert!(engine.is_timeout(&tcc, 35_000));
        assert!(engine.need_process(&tcc, 35_000));
        assert!(!engine.need_process(&tcc, 34_999));
    }

    #[test]
    fn zero_default_timeout_disables_timeouts() {
        let engine = engine(EngineConfig {
            timeout_to_fail: 0,
            ..defaults()
        });
        let mut xa = TransGlobal::new("x", TransType::Xa, TransStatus::Prepared);
        xa.create_time = 0;
        assert!(!engine.is_timeout(&xa, u64::MAX));
    }

    #[test]
    fn terminal_and_active_statuses() {
        let engine = engine(defaults());
        let now = unix_time_ms();
        for status in [TransStatus::Submitted, TransStatus::Aborting] {
            assert!(engine.need_process(&TransGlobal::new("g", TransType::Msg, status), now));
        }
        for status in [TransStatus::Succeed, TransStatus::Failed] {
            assert!(!engine.need_process(&TransGlobal::new("g", TransType::Msg, status), now));
        }
    }

    #[test]
    fn change_status_stamps_times_and_resets_cron() {
        let engine = engine(defaults());
        let mut global = TransGlobal::new("g", TransType::Tcc, TransStatus::Prepared);
        global.next_cron_interval = 80;
        engine.store().save_new_trans(&global, &[]).unwrap();
        let mut trans = Trans::new(global, Vec::new());

        engine.change_status(&mut trans, TransStatus::Submitted).unwrap();
        engine.change_status(&mut trans, TransStatus::Succeed).unwrap();
        assert!(trans.touched());

        let stored = engine.store().get_trans_global("g").unwrap();
        assert_eq!(stored.status, TransStatus::Succeed);
        assert_eq!(stored.next_cron_interval, 10);
        assert!(stored.commit_time.is_some());
        assert!(stored.finish_time.is_some());
        assert!(stored.rollback_time.is_none());
    }

    #[test]
    fn stale_change_status_is_a_lost_race() {
        let engine = engine(defaults());
        let global = TransGlobal::new("g", TransType::Saga, TransStatus::Submitted);
        engine.store().save_new_trans(&global, &[]).unwrap();
        let mut first = Trans::new(global.clone(), Vec::new());
        let mut second = Trans::new(global, Vec::new());

        engine.change_status(&mut first, TransStatus::Aborting).unwrap();
        let err: anyhow::Error = engine
            .change_status(&mut second, TransStatus::Succeed)
            .unwrap_err()
            .into();
        assert!(is_lost_race(&err));
        assert!(!is_invariant_violation(&err));
        assert_eq!(second.global.status, TransStatus::Submitted);
    }
}
