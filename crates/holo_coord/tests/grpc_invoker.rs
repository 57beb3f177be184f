mod common;

use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use holo_coord::invoke::grpc::{GrpcInvoker, RawCodec};
use holo_coord::invoke::{BranchCall, BranchInvoker, BranchOutcome};
use holo_coord::model::{BranchOp, Protocol, TransType};
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::Status;

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    gid: String,
    trans_type: String,
    branch_id: String,
    op: String,
    payload: Bytes,
}

/// `busi.Busi` participant answering by method name.
#[derive(Clone, Default)]
struct Participant {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl tonic::server::NamedService for Participant {
    const NAME: &'static str = "busi.Busi";
}

impl<B> Service<http::Request<B>> for Participant
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let method = req
            .uri()
            .path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let handler = Handler {
            method,
            seen: self.seen.clone(),
        };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec);
            Ok(grpc.unary(handler, req).await)
        })
    }
}

struct Handler {
    method: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl tonic::server::UnaryService<Bytes> for Handler {
    type Response = Bytes;
    type Future = BoxFuture<tonic::Response<Bytes>, Status>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let meta = |key: &str| {
            request
                .metadata()
                .get(key)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        self.seen.lock().unwrap().push(Seen {
            method: self.method.clone(),
            gid: meta("gid"),
            trans_type: meta("trans_type"),
            branch_id: meta("branch_id"),
            op: meta("op"),
            payload: request.get_ref().clone(),
        });
        let reply = match self.method.as_str() {
            "Ok" => Ok(tonic::Response::new(Bytes::from_static(b"ignored"))),
            "Fail" => Err(Status::aborted("FAILURE")),
            "Later" => Err(Status::aborted("ONGOING")),
            _ => Err(Status::internal("boom")),
        };
        Box::pin(async move { reply })
    }
}

async fn spawn_participant() -> (String, Arc<Mutex<Vec<Seen>>>) {
    let participant = Participant::default();
    let seen = participant.seen.clone();
    let port = common::pick_free_port().expect("free port");
    let addr = format!("127.0.0.1:{port}").parse().expect("addr");
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(participant)
            .serve(addr),
    );
    let deadline = tokio::time::Instant::now() + common::WAIT_TIMEOUT;
    while tokio::net::TcpStream::connect(addr).await.is_err() {
        assert!(tokio::time::Instant::now() < deadline, "participant never listened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (format!("127.0.0.1:{port}"), seen)
}

fn call<'a>(url: &'a str, payload: &'a [u8]) -> BranchCall<'a> {
    BranchCall {
        protocol: Protocol::Grpc,
        url,
        gid: "gid-7",
        trans_type: TransType::Tcc,
        branch_id: "02",
        op: BranchOp::Confirm,
        payload,
        headers: &[],
    }
}

#[tokio::test]
async fn unary_call_carries_payload_and_branch_metadata() {
    let (server, seen) = spawn_participant().await;
    let invoker = GrpcInvoker::new(Duration::from_secs(3));
    let url = format!("{server}/busi.Busi/Ok");

    let outcome = invoker
        .invoke(call(&url, b"\x0a\x03abc"))
        .await
        .expect("invoke");
    assert_eq!(outcome, BranchOutcome::Success);

    let seen = seen.lock().unwrap()[0].clone();
    assert_eq!(seen.method, "Ok");
    assert_eq!(seen.gid, "gid-7");
    assert_eq!(seen.trans_type, "tcc");
    assert_eq!(seen.branch_id, "02");
    assert_eq!(seen.op, "confirm");
    assert_eq!(&seen.payload[..], b"\x0a\x03abc");
}

#[tokio::test]
async fn aborted_status_maps_to_outcomes_and_other_codes_are_errors() {
    let (server, seen) = spawn_participant().await;
    let invoker = GrpcInvoker::new(Duration::from_secs(3));

    let url = format!("{server}/busi.Busi/Fail");
    assert_eq!(
        invoker.invoke(call(&url, b"")).await.expect("fail"),
        BranchOutcome::Failure
    );
    let url = format!("{server}/busi.Busi/Later");
    assert_eq!(
        invoker.invoke(call(&url, b"")).await.expect("later"),
        BranchOutcome::Ongoing
    );
    let url = format!("{server}/busi.Busi/Crash");
    let err = invoker
        .invoke(call(&url, b""))
        .await
        .expect_err("internal status");
    assert!(format!("{err:#}").contains("boom"), "{err:#}");

    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn unreachable_server_is_an_error() {
    let invoker = GrpcInvoker::new(Duration::from_millis(500));
    let port = common::pick_free_port().expect("free port");
    let url = format!("127.0.0.1:{port}/busi.Busi/Ok");
    invoker
        .invoke(call(&url, b""))
        .await
        .expect_err("connection refused");
}
