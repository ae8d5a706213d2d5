use crawler_common::{CrawlerError, Result};
use governor::{Quota, RateLimiter};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::retry::{with_retry, RetryPolicy};

pub(crate) type SharedRateLimiter = Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>;

/// Block as returned by `eth_getBlockByNumber(number, true)`.
///
/// Fields stay as raw quantity strings so that a single bad transaction can be
/// dropped by the normalizer instead of failing the whole block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub number: Option<String>,
    pub timestamp: Option<String>,
    pub transactions: Option<Vec<RawTransaction>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: Option<String>,
    pub block_number: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// JSON-RPC adapter for the node endpoint.
///
/// Cheap to clone: the HTTP client and rate limiter are shared, so every fetch
/// worker draws from the same request budget.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    limiter: SharedRateLimiter,
    retry: RetryPolicy,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(url: Url, requests_per_second: NonZeroU32, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlerError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(requests_per_second))),
            retry,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch a block with full transaction objects, retrying network errors
    /// and not-yet-available blocks with backoff. Malformed payloads are
    /// returned immediately.
    pub async fn fetch_block(&self, number: u64) -> Result<RawBlock> {
        let what = format!("eth_getBlockByNumber({})", number);
        with_retry(&self.retry, &what, move || async move {
            let params = serde_json::json!([format!("0x{:x}", number), true]);
            match self.call::<RawBlock>("eth_getBlockByNumber", params).await? {
                Some(block) => Ok(block),
                None => Err(CrawlerError::NotFound(number)),
            }
        })
        .await
    }

    /// Current chain head; doubles as the connectivity check before a run
    pub async fn block_number(&self) -> Result<u64> {
        with_retry(&self.retry, "eth_blockNumber", move || async move {
            let head = self
                .call::<String>("eth_blockNumber", serde_json::json!([]))
                .await?
                .ok_or_else(|| CrawlerError::MalformedResponse("eth_blockNumber returned null".to_string()))?;
            parse_quantity(&head)
                .ok_or_else(|| CrawlerError::MalformedResponse(format!("invalid block number '{}'", head)))
        })
        .await
    }

    /// Single JSON-RPC round trip. `Ok(None)` means the node answered with a
    /// null result.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<Option<T>> {
        self.limiter.until_ready().await;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| CrawlerError::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlerError::Network(format!("HTTP status {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CrawlerError::Network(format!("failed to read response body: {}", e)))?;

        let envelope: RpcResponse = serde_json::from_slice(&body)
            .map_err(|e| CrawlerError::MalformedResponse(format!("invalid JSON-RPC response: {}", e)))?;

        if let Some(error) = envelope.error {
            return Err(classify_rpc_error(&error));
        }

        match envelope.result {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(result) => serde_json::from_value::<T>(result)
                .map(Some)
                .map_err(|e| CrawlerError::MalformedResponse(format!("failed to decode {} result: {}", method, e))),
        }
    }
}

/// JSON-RPC 2.0 codes for requests the node will never accept: invalid
/// request, method not found, invalid params
const PERMANENT_RPC_ERRORS: [i64; 3] = [-32600, -32601, -32602];

/// Standard request errors are permanent; node-side errors (rate limits,
/// overloaded backends) are transient more often than not
fn classify_rpc_error(error: &serde_json::Value) -> CrawlerError {
    let code = error.get("code").and_then(serde_json::Value::as_i64);
    match code {
        Some(code) if PERMANENT_RPC_ERRORS.contains(&code) => {
            CrawlerError::MalformedResponse(format!("RPC rejected request: {}", error))
        }
        _ => CrawlerError::Network(format!("RPC error: {}", error)),
    }
}

/// Parse a JSON-RPC quantity (`0x`-prefixed hex) into a u64
pub(crate) fn parse_quantity(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
