use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use super::{BranchCall, BranchInvoker, BranchOutcome};
use crate::model::{RESULT_FAILURE, RESULT_ONGOING};

/// gRPC participant client. Branch URLs have the form
/// `host:port/package.Service/Method`; the payload is sent as the raw
/// request message and the reply message is ignored.
pub struct GrpcInvoker {
    request_timeout: Duration,
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcInvoker {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, server: &str) -> anyhow::Result<Channel> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(channel) = channels.get(server) {
            return Ok(channel.clone());
        }
        let endpoint = Endpoint::from_shared(format!("http://{server}"))
            .with_context(|| format!("invalid grpc server address {server}"))?
            .connect_timeout(self.request_timeout)
            .timeout(self.request_timeout);
        let channel = endpoint.connect_lazy();
        channels.insert(server.to_string(), channel.clone());
        Ok(channel)
    }
}

/// Split `host:port/package.Service/Method` into server and method path.
pub fn parse_server_method(url: &str) -> anyhow::Result<(&str, String)> {
    if url.starts_with("http") {
        anyhow::bail!("bad url for grpc branch: {url}");
    }
    let Some(slash) = url.find('/') else {
        anyhow::bail!("grpc branch url has no method: {url}");
    };
    let (server, method) = url.split_at(slash);
    if server.is_empty() || method.len() <= 1 {
        anyhow::bail!("bad url for grpc branch: {url}");
    }
    Ok((server, method.to_string()))
}

/// Map a finished unary call to a branch outcome: `Ok` is success, `Aborted`
/// carrying a FAILURE or ONGOING message is that outcome, anything else is a
/// retryable error.
pub fn classify_status(result: Result<(), Status>) -> anyhow::Result<BranchOutcome> {
    match result {
        Ok(()) => Ok(BranchOutcome::Success),
        Err(status) if status.code() == Code::Aborted && status.message() == RESULT_FAILURE => {
            Ok(BranchOutcome::Failure)
        }
        Err(status) if status.code() == Code::Aborted && status.message() == RESULT_ONGOING => {
            Ok(BranchOutcome::Ongoing)
        }
        Err(status) => Err(anyhow::Error::from(status).context("grpc branch call failed")),
    }
}

#[async_trait]
impl BranchInvoker for GrpcInvoker {
    async fn invoke(&self, call: BranchCall<'_>) -> anyhow::Result<BranchOutcome> {
        let (server, method) = parse_server_method(call.url)?;
        let path = method
            .parse::<PathAndQuery>()
            .with_context(|| format!("invalid grpc method {method}"))?;
        let mut grpc = tonic::client::Grpc::new(self.channel(server)?);

        let mut request = tonic::Request::new(Bytes::copy_from_slice(call.payload));
        let metadata = request.metadata_mut();
        let fields: [(&'static str, &str); 4] = [
            ("gid", call.gid),
            ("trans_type", call.trans_type.as_str()),
            ("branch_id", call.branch_id),
            ("op", call.op.as_str()),
        ];
        for (key, value) in fields {
            let value: AsciiMetadataValue = value
                .parse()
                .with_context(|| format!("metadata {key} is not ascii"))?;
            metadata.insert(key, value);
        }

        let result = match grpc.ready().await {
            Ok(()) => grpc.unary(request, path, RawCodec).await.map(|_| ()),
            Err(err) => Err(Status::unavailable(format!("{server} not ready: {err}"))),
        };
        tracing::debug!(
            gid = %call.gid,
            branch_id = %call.branch_id,
            op = %call.op,
            ok = result.is_ok(),
            "grpc branch answered"
        );
        classify_status(result)
    }
}

/// Passes message bytes through unchanged. Also usable on the server side
/// with `tonic::server::Grpc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}
