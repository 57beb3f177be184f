//! Per-type drivers. Each returns once the transaction is terminal, a branch
//! is still in flight, or an error stops the cycle.

use super::{BranchProgress, Engine, Trans};
use crate::cron::CronType;
use crate::invoke::BranchOutcome;
use crate::model::{BranchOp, BranchStatus, TransStatus};

/// Whether every branch in a run completed.
enum Run {
    Complete,
    Pending,
}

impl Engine {
    pub(super) async fn process_saga(&self, trans: &mut Trans) -> anyhow::Result<()> {
        if trans.global.status == TransStatus::Prepared {
            self.change_status(trans, TransStatus::Aborting)?;
        }
        let actions = trans.indices_of(BranchOp::Action);

        if trans.global.status == TransStatus::Submitted {
            let mut failed = false;
            for &idx in &actions {
                let status = trans.branches[idx].status;
                if status == BranchStatus::Succeed {
                    continue;
                }
                if status == BranchStatus::Failed {
                    failed = true;
                    break;
                }
                match self.exec_branch(trans, idx).await? {
                    BranchProgress::Succeed => {}
                    BranchProgress::Failed => {
                        failed = true;
                        break;
                    }
                    BranchProgress::Ongoing => return Ok(()),
                }
            }
            if !failed {
                self.change_status(trans, TransStatus::Succeed)?;
                return Ok(());
            }
            self.change_status(trans, TransStatus::Aborting)?;
        }

        if trans.global.status != TransStatus::Aborting {
            return Ok(());
        }
        // Steps after the first unfinished action never started.
        let started = actions
            .iter()
            .position(|&idx| trans.branches[idx].status != BranchStatus::Succeed)
            .map_or(actions.len(), |pos| pos + 1);
        let compensations: Vec<usize> = actions[..started]
            .iter()
            .rev()
            .filter_map(|&idx| {
                trans.branch_index(&trans.branches[idx].branch_id, BranchOp::Compensate)
            })
            .collect();
        if let Run::Pending = self.run_branches(trans, &compensations).await? {
            return Ok(());
        }
        self.change_status(trans, TransStatus::Failed)?;
        Ok(())
    }

    /// TCC (confirm/cancel) and XA (commit/rollback).
    pub(super) async fn process_two_phase(
        &self,
        trans: &mut Trans,
        forward: BranchOp,
        backward: BranchOp,
    ) -> anyhow::Result<()> {
        if trans.global.status == TransStatus::Prepared {
            self.change_status(trans, TransStatus::Aborting)?;
        }
        match trans.global.status {
            TransStatus::Submitted => {
                let branches = trans.indices_of(forward);
                if let Run::Complete = self.run_branches(trans, &branches).await? {
                    self.change_status(trans, TransStatus::Succeed)?;
                }
            }
            TransStatus::Aborting => {
                let mut branches = trans.indices_of(backward);
                branches.reverse();
                if let Run::Complete = self.run_branches(trans, &branches).await? {
                    self.change_status(trans, TransStatus::Failed)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub(super) async fn process_msg(&self, trans: &mut Trans) -> anyhow::Result<()> {
        if trans.global.status == TransStatus::Prepared {
            match self.query_prepared(trans).await {
                Ok(BranchOutcome::Success) => self.change_status(trans, TransStatus::Submitted)?,
                Ok(BranchOutcome::Failure) => {
                    self.change_status(trans, TransStatus::Failed)?;
                    return Ok(());
                }
                Ok(BranchOutcome::Ongoing) => {
                    self.touch(trans, CronType::Reset)?;
                    return Ok(());
                }
                Err(err) => {
                    self.stats.record_branch_error();
                    self.touch(trans, CronType::Backoff)?;
                    return Err(err.context("query prepared"));
                }
            }
        }
        match trans.global.status {
            TransStatus::Submitted => {
                let branches = trans.indices_of(BranchOp::Action);
                if let Run::Complete = self.run_branches(trans, &branches).await? {
                    self.change_status(trans, TransStatus::Succeed)?;
                }
            }
            // Nothing to undo for a message.
            TransStatus::Aborting => self.change_status(trans, TransStatus::Failed)?,
            _ => {}
        }
        Ok(())
    }

    /// Call each listed branch that is still `prepared`, in order.
    async fn run_branches(&self, trans: &mut Trans, indices: &[usize]) -> anyhow::Result<Run> {
        for &idx in indices {
            if trans.branches[idx].status.is_terminal() {
                continue;
            }
            if let BranchProgress::Ongoing = self.exec_branch(trans, idx).await? {
                return Ok(Run::Pending);
            }
        }
        Ok(Run::Complete)
    }
}
