//! Node runtime: wires the store, engine, writer, and scheduler together.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;

use crate::branch_writer::{BranchWriter, BranchWriterConfig, BranchWriterTask};
use crate::config::{CoordConfig, NodeArgs};
use crate::coordinator::Coordinator;
use crate::engine::{Engine, EngineConfig};
use crate::invoke::{BranchInvoker, ProtocolInvoker};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::stats::{spawn_stats_logger, CoordStats};
use crate::store::{open_store, TransStore};

/// A started coordinator node.
pub struct Node {
    coordinator: Arc<Coordinator>,
    scheduler: Scheduler,
    writer_task: Option<BranchWriterTask>,
    stats_task: Option<tokio::task::JoinHandle<()>>,
}

impl Node {
    /// Start background tasks on an already opened store.
    pub fn start(
        cfg: &CoordConfig,
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
    ) -> Self {
        let stats = Arc::new(CoordStats::default());
        let (writer, writer_task) = if cfg.update_branch_sync {
            (None, None)
        } else {
            let (writer, task) = BranchWriter::spawn(
                store.clone(),
                stats.clone(),
                BranchWriterConfig {
                    queue_capacity: cfg.branch_queue_capacity,
                    batch_max: cfg.branch_batch_max,
                    batch_wait: cfg.branch_batch_wait,
                },
            );
            (Some(writer), Some(task))
        };
        let engine = Arc::new(Engine::new(
            store,
            invoker,
            writer,
            stats.clone(),
            EngineConfig::from(cfg),
        ));
        let coordinator = Arc::new(Coordinator::new(engine.clone()));
        let scheduler = Scheduler::spawn(
            engine,
            SchedulerConfig::from(cfg),
            coordinator.processed_sender(),
        );
        let stats_task = if cfg.stats_interval.is_zero() {
            None
        } else {
            Some(spawn_stats_logger(stats, cfg.stats_interval))
        };
        Self {
            coordinator,
            scheduler,
            writer_task,
            stats_task,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Stop the scheduler, then let the branch writer drain.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        if let Some(task) = self.stats_task {
            task.abort();
        }
        // Coordinator clones held elsewhere keep their sender; closing the
        // writer fails their later sends instead of waiting for them.
        if let Some(task) = self.writer_task {
            task.close().await;
        }
    }
}

pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a node until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = Result<(), std::io::Error>> + Send,
{
    let cfg = CoordConfig::from(&args);
    let store = open_store(&cfg).context("open transaction store")?;
    let invoker = ProtocolInvoker::shared(cfg.request_timeout)?;
    let node = Node::start(&cfg, store, invoker);
    tracing::info!(
        store = ?cfg.store_driver,
        data_dir = %cfg.data_dir.display(),
        update_branch_sync = cfg.update_branch_sync,
        "coordinator node running"
    );

    if let Err(err) = shutdown.await {
        tracing::warn!(error = ?err, "shutdown signal listener failed");
    }
    tracing::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
