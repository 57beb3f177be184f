use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use super::{classify_body, BranchCall, BranchInvoker, BranchOutcome};
use crate::model::TransType;

/// HTTP participant client. Requests are POST when the branch carries a
/// payload or the transaction is XA, GET otherwise.
#[derive(Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BranchInvoker for HttpInvoker {
    async fn invoke(&self, call: BranchCall<'_>) -> anyhow::Result<BranchOutcome> {
        if !call.url.starts_with("http") {
            anyhow::bail!("bad url for http branch: {}", call.url);
        }
        let post = !call.payload.is_empty() || call.trans_type == TransType::Xa;
        let mut request = if post {
            self.client.post(call.url).body(call.payload.to_vec())
        } else {
            self.client.get(call.url)
        };
        request = request
            .query(&[
                ("gid", call.gid),
                ("trans_type", call.trans_type.as_str()),
                ("branch_id", call.branch_id),
                ("op", call.op.as_str()),
            ])
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in call.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("call {}", call.url))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("read response body from {}", call.url))?;
        tracing::debug!(
            gid = %call.gid,
            branch_id = %call.branch_id,
            op = %call.op,
            status = status.as_u16(),
            "http branch answered"
        );
        classify_body(&body)
    }
}
