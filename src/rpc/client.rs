//! Rate-limited JSON-RPC client, one per network.
//!
//! Two independent throttles apply to every call: a token bucket sized by
//! the network's `max_requests_per_second`, and a semaphore capping in-flight
//! requests so one slow provider cannot head-of-line block the bucket.
//! Transient failures retry with exponential backoff (capped at 60 s,
//! unbounded attempts); permanent failures surface immediately to the caller.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use backon::{ExponentialBuilder, Retryable};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::metrics::{Metrics, RpcLabels};
use crate::rpc::models::{RpcBlock, RpcLog, RpcReceipt};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_MIN_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("http status {0}")]
    Http(u16),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("response too large: {0}")]
    TooLarge(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Timeouts, connection failures, 5xx and provider rate limits are
    /// retried; everything else aborts the fetch.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_)
                | RpcError::Timeout
                | RpcError::RateLimited
                | RpcError::Http(500..=599)
        )
    }

    /// Signals the historical chunker to bisect the requested range.
    pub fn is_too_large(&self) -> bool {
        matches!(self, RpcError::TooLarge(_))
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return RpcError::Timeout;
        }
        if let Some(status) = error.status() {
            if status.as_u16() == 429 {
                return RpcError::RateLimited;
            }
            return RpcError::Http(status.as_u16());
        }
        RpcError::Transport(error.to_string())
    }

    fn from_rpc(code: i64, message: String) -> Self {
        let lowered = message.to_lowercase();
        // Providers disagree on the error code for oversized ranges; the
        // message is the reliable signal.
        if code == -32005
            || lowered.contains("too large")
            || lowered.contains("more than")
            || lowered.contains("response size")
            || lowered.contains("block range")
        {
            return RpcError::TooLarge(message);
        }
        if lowered.contains("rate limit") || lowered.contains("too many requests") {
            return RpcError::RateLimited;
        }
        RpcError::Rpc { code, message }
    }
}

pub struct RpcClient {
    chain_id: u64,
    url: String,
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
    inflight: Arc<Semaphore>,
    request_id: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl RpcClient {
    pub fn new(chain_id: u64, url: String, network: &NetworkConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(network.max_requests_per_second).unwrap_or(NonZeroU32::MIN),
        );
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible with static options");
        RpcClient {
            chain_id,
            url,
            http,
            limiter: RateLimiter::direct(quota),
            inflight: Arc::new(Semaphore::new(network.max_concurrent_requests.max(1) as usize)),
            request_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn retry_policy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(RETRY_MIN_DELAY)
            .with_max_delay(RETRY_MAX_DELAY)
            .with_max_times(usize::MAX)
            .with_jitter()
    }

    /// One throttled attempt, no retries.
    async fn request_once(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.limiter.until_ready().await;
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| RpcError::Transport("client shut down".into()))?;

        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        debug!(chain_id = self.chain_id, method, "rpc request");
        if let Some(metrics) = &self.metrics {
            metrics
                .rpc_requests
                .get_or_create(&RpcLabels {
                    chain_id: self.chain_id,
                    method: method.to_string(),
                })
                .inc();
        }

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(RpcError::from_reqwest)?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RpcError::RateLimited);
        }
        if !status.is_success() {
            return Err(RpcError::Http(status.as_u16()));
        }
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;
        if let Some(error) = envelope.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(RpcError::from_rpc(code, message));
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::Malformed("missing result field".into()))
    }

    /// Throttled request retrying transient failures indefinitely. "Too
    /// large" is deliberately not retried here so the chunker can bisect.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let chain_id = self.chain_id;
        (|| async { self.request_once(method, params.clone()).await })
            .retry(&Self::retry_policy())
            .when(RpcError::is_transient)
            .notify(move |error: &RpcError, delay: Duration| {
                warn!(chain_id, %error, ?delay, "transient rpc failure, backing off");
            })
            .await
    }

    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    pub async fn get_latest_block(&self) -> Result<RpcBlock, RpcError> {
        self.get_block_by_tag(json!("latest"), false)
            .await?
            .ok_or_else(|| RpcError::Malformed("node returned no latest block".into()))
    }

    pub async fn get_block_by_number(
        &self,
        number: u64,
        hydrated: bool,
    ) -> Result<Option<RpcBlock>, RpcError> {
        self.get_block_by_tag(json!(format!("0x{number:x}")), hydrated)
            .await
    }

    async fn get_block_by_tag(
        &self,
        tag: Value,
        hydrated: bool,
    ) -> Result<Option<RpcBlock>, RpcError> {
        let result = self
            .request("eth_getBlockByNumber", json!([tag, hydrated]))
            .await?;
        decode_optional(result)
    }

    pub async fn get_block_by_hash(
        &self,
        hash: B256,
        hydrated: bool,
    ) -> Result<Option<RpcBlock>, RpcError> {
        let result = self
            .request("eth_getBlockByHash", json!([hash, hydrated]))
            .await?;
        decode_optional(result)
    }

    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topic0: &[B256],
    ) -> Result<Vec<RpcLog>, RpcError> {
        let mut filter = json!({
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        });
        if !addresses.is_empty() {
            filter["address"] = json!(addresses);
        }
        if !topic0.is_empty() {
            filter["topics"] = json!([topic0]);
        }
        let result = self.request("eth_getLogs", json!([filter])).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<RpcReceipt>, RpcError> {
        let result = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        decode_optional(result)
    }
}

fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    value
        .as_str()
        .and_then(crate::rpc::models::quantity::parse)
        .ok_or_else(|| RpcError::Malformed(format!("expected quantity, got {value}")))
}

fn decode_optional<T: serde::de::DeserializeOwned>(value: Value) -> Result<Option<T>, RpcError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| RpcError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RpcError::Timeout.is_transient());
        assert!(RpcError::RateLimited.is_transient());
        assert!(RpcError::Http(503).is_transient());
        assert!(!RpcError::Http(400).is_transient());
        assert!(!RpcError::Rpc {
            code: -32602,
            message: "invalid params".into()
        }
        .is_transient());
        assert!(!RpcError::TooLarge("10k logs".into()).is_transient());
    }

    #[test]
    fn oversized_responses_detected_across_providers() {
        for message in [
            "query returned more than 10000 results",
            "Response size exceeded",
            "block range too large",
        ] {
            let error = RpcError::from_rpc(-32602, message.to_string());
            assert!(error.is_too_large(), "{message} should signal bisection");
        }
        assert!(RpcError::from_rpc(-32005, "limit exceeded".into()).is_too_large());
        assert!(!RpcError::from_rpc(-32602, "invalid params".into()).is_too_large());
    }

    #[test]
    fn provider_rate_limit_messages_are_transient() {
        let error = RpcError::from_rpc(-32016, "rate limit reached".into());
        assert!(matches!(error, RpcError::RateLimited));
    }
}
