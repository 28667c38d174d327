//! Minimal JSON-RPC 2.0 client shared by the chain providers

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ProviderError;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug)]
pub(crate) struct RpcClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    pub(crate) fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("custody-anchor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method`; a missing `result` comes back as `Value::Null`
    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(format!("{}: {}", method, e))
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited {
                message: format!("{} returned HTTP 429", method),
                retry_after,
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Network(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let resp: JsonRpcResponse = serde_json::from_slice(&bytes)?;

        if let Some(err) = resp.error {
            return Err(ProviderError::from_rpc(err.code, err.message));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}

/// Parse a `0x`-prefixed hex quantity
pub(crate) fn parse_quantity(v: &Value) -> Result<u64, ProviderError> {
    let s = v
        .as_str()
        .ok_or_else(|| ProviderError::Rpc {
            code: 0,
            message: format!("expected hex quantity, got {}", v),
        })?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| ProviderError::Rpc {
        code: 0,
        message: format!("bad hex quantity {}: {}", s, e),
    })
}
