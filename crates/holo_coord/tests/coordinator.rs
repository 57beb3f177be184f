mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, Reply, ScriptedInvoker, TestStore, BACKENDS, SUCCESS};
use holo_coord::model::{BranchOp, BranchStatus, TransBranch, TransOptions, TransStatus, TransType};
use holo_coord::{gen_gid, CoordConfig, Coordinator, Node, TransRequest};

fn waiting() -> TransOptions {
    TransOptions {
        wait_result: true,
        ..TransOptions::default()
    }
}

fn action(id: &str, url: &str) -> TransBranch {
    TransBranch::new("", id, BranchOp::Action, url, Vec::new())
}

#[tokio::test]
async fn submit_with_wait_result_reports_the_final_status() {
    for backend in BACKENDS {
        let ts = TestStore::open(backend);
        let invoker = ScriptedInvoker::new();
        let coordinator = Coordinator::new(Arc::new(common::sync_engine(
            ts.store.clone(),
            invoker.clone(),
        )));

        let gid = gen_gid();
        let mut req = TransRequest::new(gid.clone(), TransType::Saga)
            .with_branch(action("01", "http://p/a1"))
            .with_branch(action("02", "http://p/a2"));
        req.options = waiting();
        invoker.script("http://p/a1", [SUCCESS]);
        invoker.script("http://p/a2", [SUCCESS]);

        let status = coordinator.submit(req.clone()).await.expect("submit");
        assert_eq!(status, TransStatus::Succeed, "{backend:?}");

        // A duplicate submit is acknowledged without touching participants.
        let status = coordinator.submit(req).await.expect("resubmit");
        assert_eq!(status, TransStatus::Succeed);
        assert_eq!(invoker.calls().len(), 2);

        let (global, branches) = coordinator.query(&gid).expect("query");
        assert!(global.commit_time.is_some());
        assert!(global.finish_time.is_some());
        assert!(branches.iter().all(|b| b.gid == gid && b.status == BranchStatus::Succeed));
    }
}

#[tokio::test]
async fn prepared_transaction_collects_branches_then_submits() {
    let ts = TestStore::open(common::Backend::Sql);
    let invoker = ScriptedInvoker::new();
    let coordinator = Coordinator::new(Arc::new(common::sync_engine(
        ts.store.clone(),
        invoker.clone(),
    )));

    let gid = "T-prepared";
    let mut req = TransRequest::new(gid, TransType::Msg);
    req.options = waiting();
    coordinator.prepare(req.clone()).expect("prepare");
    coordinator.prepare(req.clone()).expect("prepare is idempotent");
    coordinator
        .prepare(TransRequest::new(gid, TransType::Saga))
        .expect_err("type mismatch");

    coordinator
        .register_branch(gid, vec![action("01", "http://p/m1")])
        .expect("register");
    invoker.script("http://p/m1", [SUCCESS]);
    invoker.script("http://p/m2", [SUCCESS]);

    let status = coordinator
        .submit(req.with_branch(action("02", "http://p/m2")))
        .await
        .expect("submit");
    assert_eq!(status, TransStatus::Succeed);
    assert_eq!(invoker.urls_called(), vec!["http://p/m1", "http://p/m2"]);

    coordinator
        .register_branch(gid, vec![action("03", "http://p/m3")])
        .expect_err("branches can only join a prepared transaction");
    let (_, branches) = coordinator.query(gid).expect("query");
    assert_eq!(branches.len(), 2);
}

#[tokio::test]
async fn abort_runs_cancels_for_a_prepared_tcc() {
    let ts = TestStore::open(common::Backend::Kv);
    let invoker = ScriptedInvoker::new();
    let coordinator = Coordinator::new(Arc::new(common::sync_engine(
        ts.store.clone(),
        invoker.clone(),
    )));

    let gid = "T-abort";
    let mut req = TransRequest::new(gid, TransType::Tcc);
    req.options = waiting();
    for id in ["01", "02"] {
        req = req
            .with_branch(TransBranch::new("", id, BranchOp::Confirm, format!("http://p/confirm{id}"), Vec::new()))
            .with_branch(TransBranch::new("", id, BranchOp::Cancel, format!("http://p/cancel{id}"), Vec::new()));
    }
    coordinator.prepare(req).expect("prepare");

    invoker.script("http://p/cancel02", [SUCCESS]);
    invoker.script("http://p/cancel01", [SUCCESS]);
    let status = coordinator.abort(gid).await.expect("abort");
    assert_eq!(status, TransStatus::Failed);
    assert_eq!(
        invoker.urls_called(),
        vec!["http://p/cancel02", "http://p/cancel01"]
    );

    assert_eq!(coordinator.abort(gid).await.expect("repeat abort"), TransStatus::Failed);
    coordinator.abort("missing").await.expect_err("unknown gid");
}

#[tokio::test]
async fn node_recovers_a_transaction_the_inline_attempt_left_behind() {
    let ts = TestStore::open(common::Backend::Sql);
    let invoker = ScriptedInvoker::new();
    let cfg = CoordConfig {
        data_dir: ts.dir.path().to_path_buf(),
        retry_interval: 1,
        visibility_window: Duration::from_millis(200),
        cron_poll_interval: Duration::from_millis(50),
        workers: 2,
        stats_interval: Duration::ZERO,
        ..CoordConfig::default()
    };
    let node = Node::start(&cfg, ts.store.clone(), invoker.clone());
    let mut processed = node.coordinator().subscribe_processed();

    let gid = gen_gid();
    invoker.script("http://p/flaky", [Reply::Error("connection reset"), SUCCESS]);
    let status = node
        .coordinator()
        .submit(TransRequest::new(gid.clone(), TransType::Saga).with_branch(action("01", "http://p/flaky")))
        .await
        .expect("submit");
    assert_eq!(status, TransStatus::Submitted);

    let first = tokio::time::timeout(common::WAIT_TIMEOUT, processed.recv())
        .await
        .expect("inline cycle")
        .expect("processed gid");
    assert_eq!(first, gid);

    let store = ts.store.clone();
    wait_until("cron recovery", || {
        store
            .get_trans_global(&gid)
            .map(|global| global.status == TransStatus::Succeed)
            .unwrap_or(false)
    })
    .await;
    node.shutdown().await;

    // The async writer has drained by the time shutdown returns.
    let branches = ts.store.get_branches(&gid).expect("branches");
    assert_eq!(branches[0].status, BranchStatus::Succeed);
    assert_eq!(invoker.calls().len(), 2);
}

#[tokio::test]
async fn shutdown_completes_while_a_coordinator_handle_is_held() {
    let ts = TestStore::open(common::Backend::Sql);
    let invoker = ScriptedInvoker::new();
    let cfg = CoordConfig {
        data_dir: ts.dir.path().to_path_buf(),
        cron_poll_interval: Duration::from_millis(50),
        stats_interval: Duration::ZERO,
        ..CoordConfig::default()
    };
    let node = Node::start(&cfg, ts.store.clone(), invoker.clone());
    let front_end = node.coordinator().clone();

    let gid = gen_gid();
    let mut req = TransRequest::new(gid.clone(), TransType::Msg).with_branch(action("01", "http://p/m1"));
    req.options = waiting();
    invoker.script("http://p/m1", [SUCCESS]);
    assert_eq!(front_end.submit(req).await.expect("submit"), TransStatus::Succeed);

    tokio::time::timeout(Duration::from_secs(3), node.shutdown())
        .await
        .expect("shutdown does not wait for outside coordinator handles");
    let (global, _) = front_end.query(&gid).expect("query after shutdown");
    assert_eq!(global.status, TransStatus::Succeed);
}
