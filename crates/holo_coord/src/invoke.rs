//! Participant calls.
//!
//! A branch call carries `{gid, trans_type, branch_id, op}` and the opaque
//! branch payload. The participant answers with one of three result tokens;
//! anything else is an error the engine retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{
    BranchOp, Protocol, TransType, RESULT_FAILURE, RESULT_ONGOING, RESULT_SUCCESS,
};

pub mod grpc;
pub mod http;

pub use grpc::GrpcInvoker;
pub use http::HttpInvoker;

/// Decoded participant answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    Success,
    Failure,
    Ongoing,
}

impl BranchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchOutcome::Success => RESULT_SUCCESS,
            BranchOutcome::Failure => RESULT_FAILURE,
            BranchOutcome::Ongoing => RESULT_ONGOING,
        }
    }
}

/// Everything needed to call one participant endpoint.
#[derive(Debug, Clone, Copy)]
pub struct BranchCall<'a> {
    pub protocol: Protocol,
    pub url: &'a str,
    pub gid: &'a str,
    pub trans_type: TransType,
    pub branch_id: &'a str,
    pub op: BranchOp,
    pub payload: &'a [u8],
    pub headers: &'a [(String, String)],
}

#[async_trait]
pub trait BranchInvoker: Send + Sync + 'static {
    /// Call the participant. Transport failures and unrecognized answers are
    /// errors; the three result tokens are values.
    async fn invoke(&self, call: BranchCall<'_>) -> anyhow::Result<BranchOutcome>;
}

/// Classify an HTTP response body by the first token it contains, checked in
/// SUCCESS, FAILURE, ONGOING order.
pub fn classify_body(body: &str) -> anyhow::Result<BranchOutcome> {
    if body.contains(RESULT_SUCCESS) {
        Ok(BranchOutcome::Success)
    } else if body.contains(RESULT_FAILURE) {
        Ok(BranchOutcome::Failure)
    } else if body.contains(RESULT_ONGOING) {
        Ok(BranchOutcome::Ongoing)
    } else {
        anyhow::bail!(
            "participant result must contain SUCCESS, FAILURE or ONGOING; will retry: {}",
            truncate(body, 256)
        )
    }
}

fn truncate(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Routes each call to the HTTP or gRPC client by the transaction protocol.
pub struct ProtocolInvoker {
    http: HttpInvoker,
    grpc: GrpcInvoker,
}

impl ProtocolInvoker {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpInvoker::new(request_timeout)?,
            grpc: GrpcInvoker::new(request_timeout),
        })
    }

    pub fn shared(request_timeout: Duration) -> anyhow::Result<Arc<dyn BranchInvoker>> {
        Ok(Arc::new(Self::new(request_timeout)?))
    }
}

#[async_trait]
impl BranchInvoker for ProtocolInvoker {
    async fn invoke(&self, call: BranchCall<'_>) -> anyhow::Result<BranchOutcome> {
        match call.protocol {
            Protocol::Http => self.http.invoke(call).await,
            Protocol::Grpc => self.grpc.invoke(call).await,
        }
    }
}
