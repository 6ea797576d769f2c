//! Node RPC.
//!
//! The pool needs three things from a node: fresh block templates, a way to
//! submit a solved block, and a lookup from a reward transaction to the block
//! that included it. [`NodeClient`] is that seam. [`RpcNodeClient`] speaks
//! JSON-RPC over HTTP, and [`poll_templates`] turns its template call into
//! the template feed the Stratum engine consumes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::template::{BlockTemplate, Hash};
use crate::tracing::prelude::*;

/// Node verdict on a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReport {
    Success,
    Rejected(String),
}

/// Block that carried a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub block_hash: String,
    pub daa_score: u64,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Current block template paying to the pool.
    async fn block_template(&self) -> Result<BlockTemplate>;

    /// Submit a template whose header carries a winning nonce.
    async fn submit_block(&self, block: &BlockTemplate) -> Result<SubmitReport>;

    /// Block that included the given transaction.
    async fn block_info(&self, txn_id: &str) -> Result<BlockInfo>;
}

/// JSON-RPC over HTTP.
pub struct RpcNodeClient {
    client: reqwest::Client,
    url: String,
    pay_address: String,
    extra_data: String,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct TemplateResponse {
    block: BlockTemplate,
}

#[derive(Deserialize)]
struct SubmitResponse {
    report: RawReport,
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(rename = "type")]
    kind: String,
    reason: Option<String>,
}

impl RpcNodeClient {
    pub fn new(
        url: impl Into<String>,
        pay_address: impl Into<String>,
        extra_data: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            pay_address: pay_address.into(),
            extra_data: extra_data.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(e) = response.error {
            return Err(Error::Node(format!("{method}: {} (code {})", e.message, e.code)));
        }
        response
            .result
            .ok_or_else(|| Error::Node(format!("{method}: empty result")))
    }
}

#[async_trait]
impl NodeClient for RpcNodeClient {
    async fn block_template(&self) -> Result<BlockTemplate> {
        let response: TemplateResponse = self
            .call(
                "getBlockTemplate",
                json!({ "payAddress": self.pay_address, "extraData": self.extra_data }),
            )
            .await?;
        Ok(response.block)
    }

    async fn submit_block(&self, block: &BlockTemplate) -> Result<SubmitReport> {
        let response: SubmitResponse = self
            .call(
                "submitBlock",
                json!({ "block": block, "allowNonDaaBlocks": false }),
            )
            .await?;
        Ok(parse_report(response.report))
    }

    async fn block_info(&self, txn_id: &str) -> Result<BlockInfo> {
        self.call("getBlockByTransactionId", json!({ "transactionId": txn_id }))
            .await
    }
}

fn parse_report(report: RawReport) -> SubmitReport {
    if report.kind.eq_ignore_ascii_case("success") {
        SubmitReport::Success
    } else {
        SubmitReport::Rejected(report.reason.unwrap_or(report.kind))
    }
}

/// Fetch templates every `interval` and forward each new one.
///
/// Consecutive identical templates are forwarded once. Fetch errors are
/// logged and retried on the next tick. Returns when cancelled or when the
/// receiving side has gone away.
pub async fn poll_templates(
    node: Arc<dyn NodeClient>,
    interval: Duration,
    templates: mpsc::Sender<BlockTemplate>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<Hash> = None;
    let mut failing = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let template = match node.block_template().await {
            Ok(template) => template,
            Err(e) => {
                // Log the first failure loudly, repeats quietly
                if failing {
                    debug!(error = %e, "Template fetch still failing");
                } else {
                    warn!(error = %e, "Failed to fetch block template");
                }
                failing = true;
                continue;
            }
        };
        if failing {
            info!("Template fetch recovered");
            failing = false;
        }

        let hash = template.header.hash();
        if last == Some(hash) {
            continue;
        }
        last = Some(hash);
        trace!(hash = %hash, daa_score = template.header.daa_score, "New block template");

        if templates.send(template).await.is_err() {
            debug!("Template receiver closed, stopping poller");
            break;
        }
    }
}
