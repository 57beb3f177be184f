//! Recovery scheduler.
//!
//! Every replica runs its own workers. Each worker claims one due
//! transaction through the store lease, drives it, and immediately tries the
//! next; when nothing is due it sleeps for a jittered poll interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::CoordConfig;
use crate::cron::CronType;
use crate::engine::{is_invariant_violation, is_lost_race, Engine};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub visibility_window: Duration,
    pub poll_interval: Duration,
}

impl From<&CoordConfig> for SchedulerConfig {
    fn from(cfg: &CoordConfig) -> Self {
        Self {
            workers: cfg.workers,
            visibility_window: cfg.visibility_window,
            poll_interval: cfg.cron_poll_interval,
        }
    }
}

/// What one scheduler cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronCycle {
    /// Nothing was due.
    Idle,
    /// The claimed transaction was driven without error.
    Processed(String),
    /// Another replica or a client call changed the transaction first.
    LostRace(String),
    /// A participant or storage error stopped the cycle; it was rescheduled.
    Retrying(String),
}

/// Claim and drive at most one due transaction. Only invariant violations and
/// claim failures are returned as errors.
pub async fn cron_trans_once(
    engine: &Engine,
    visibility_window: Duration,
    processed: &broadcast::Sender<String>,
) -> anyhow::Result<CronCycle> {
    let store = engine.store().clone();
    let claimed = tokio::task::spawn_blocking(move || store.lock_one_global_trans(visibility_window))
        .await
        .context("claim task")?;
    let global = match claimed {
        Ok(global) => global,
        Err(err) if err.is_not_found() => {
            engine.stats().record_cron_cycle(false);
            return Ok(CronCycle::Idle);
        }
        Err(err) => return Err(err.into()),
    };
    engine.stats().record_cron_cycle(true);
    let gid = global.gid.clone();
    tracing::debug!(gid = %gid, owner = %global.owner, status = %global.status, "claimed transaction");

    let mut trans = engine.attach_branches(global)?;
    let mut result = engine.process(&mut trans).await;
    if result.is_ok() && !trans.global.status.is_terminal() && !trans.touched() {
        // Nothing rescheduled it during the cycle.
        result = engine
            .touch(&mut trans, CronType::Keep)
            .map_err(anyhow::Error::from);
    }
    let _ = processed.send(gid.clone());

    match result {
        Ok(()) => Ok(CronCycle::Processed(gid)),
        Err(err) if is_lost_race(&err) => {
            engine.stats().record_lost_race();
            tracing::debug!(gid = %gid, "transaction changed by another party; skipping");
            Ok(CronCycle::LostRace(gid))
        }
        Err(err) if is_invariant_violation(&err) => {
            tracing::error!(gid = %gid, error = ?err, "storage invariant violated; aborting cycle");
            Err(err)
        }
        Err(err) => {
            tracing::warn!(gid = %gid, error = ?err, "transaction cycle failed; will retry");
            if !trans.touched() && !trans.global.status.is_terminal() {
                if let Err(touch_err) = engine.touch(&mut trans, CronType::Backoff) {
                    tracing::warn!(gid = %gid, error = ?touch_err, "backoff reschedule failed");
                }
            }
            Ok(CronCycle::Retrying(gid))
        }
    }
}

/// Handle to the running worker tasks.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(
        engine: Arc<Engine>,
        cfg: SchedulerConfig,
        processed: broadcast::Sender<String>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = (0..cfg.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    engine.clone(),
                    cfg,
                    processed.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        tracing::info!(
            workers = cfg.workers.max(1),
            visibility_ms = cfg.visibility_window.as_millis() as u64,
            poll_ms = cfg.poll_interval.as_millis() as u64,
            "recovery scheduler started"
        );
        Self { shutdown, workers }
    }

    /// Stop claiming new work and wait for in-flight cycles to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = ?err, "scheduler worker ended abnormally");
            }
        }
        tracing::info!("recovery scheduler stopped");
    }
}

async fn run_worker(
    worker: usize,
    engine: Arc<Engine>,
    cfg: SchedulerConfig,
    processed: broadcast::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let idle = match cron_trans_once(&engine, cfg.visibility_window, &processed).await {
            Ok(CronCycle::Idle) => true,
            Ok(_) => false,
            Err(err) => {
                tracing::error!(worker, error = ?err, "recovery cycle failed");
                true
            }
        };
        if !idle {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(jittered(cfg.poll_interval)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker, "scheduler worker exiting");
}

/// Somewhere between half and all of `interval`, so replicas drift apart.
fn jittered(interval: Duration) -> Duration {
    let full = interval.as_millis().min(u128::from(u64::MAX)) as u64;
    if full < 2 {
        return interval;
    }
    Duration::from_millis(rand::thread_rng().gen_range(full / 2..=full))
}
