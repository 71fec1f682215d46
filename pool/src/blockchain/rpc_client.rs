/// Node RPC client - JSON-RPC over HTTP with a circuit breaker
///
/// Used for block templates, found-block submission and miner address
/// validation. Failures are returned to the caller; nothing here is fatal.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::template::BlockTemplate;
use crate::metrics::prometheus as metrics;

/// Upstream node operations the pool depends on.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_block_template(&self) -> Result<BlockTemplate>;

    /// Returns true when the node accepted the block.
    async fn submit_block(&self, block_hex: &str) -> Result<bool>;

    /// Miner identity format check, delegated to the node.
    async fn validate_address(&self, address: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "Node RPC circuit breaker tripped after {} failures, pausing for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Node RPC circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("Node RPC circuit breaker half-open");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(anyhow!("RPC circuit breaker is open"));
                }
            }
        }
        Ok(())
    }
}

pub struct NodeRpcClient {
    url: String,
    authorization: Option<String>,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl NodeRpcClient {
    /// `authorization` is sent verbatim as the `Authorization` header
    /// (e.g. `Basic dXNlcjpwYXNz`).
    pub fn new(url: String, authorization: Option<String>, timeout: Option<Duration>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("Node RPC client initialized: {}", url);

        Self {
            url,
            authorization,
            timeout: timeout.unwrap_or(Duration::from_secs(30)),
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Make a JSON-RPC call.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();
        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        {
            let mut breaker = self.circuit_breaker.write().await;
            breaker.check()?;
        }

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json");
        if let Some(auth) = &self.authorization {
            builder = builder.header("Authorization", auth);
        }
        let req = builder.body(body)?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.circuit_breaker.write().await.record_failure();
                return Err(anyhow!("RPC connection failed: {}", e));
            }
            Err(_) => {
                self.circuit_breaker.write().await.record_failure();
                return Err(anyhow!("RPC request timeout"));
            }
        };

        let status = response.status();
        let body_bytes = response.into_body().collect().await?.to_bytes();

        // Bitcoin-style nodes answer application errors with HTTP 500 and a
        // JSON-RPC error body; only transport-level failures trip the breaker.
        let rpc_response: RpcResponse = match serde_json::from_reader(body_bytes.reader()) {
            Ok(r) => r,
            Err(e) => {
                self.circuit_breaker.write().await.record_failure();
                return Err(anyhow!("RPC HTTP {} with unreadable body: {}", status, e));
            }
        };

        if let Some(error) = rpc_response.error.filter(|e| !e.is_null()) {
            return Err(anyhow!("RPC error from {}: {}", method, error));
        }

        self.circuit_breaker.write().await.record_success();

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

/// Interpret a `submitblock` result. `null` means accepted on Bitcoin-style
/// nodes; a string is a rejection reason.
pub fn submit_result_accepted(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::Bool(b) => *b,
        Value::Object(obj) => obj
            .get("accepted")
            .and_then(Value::as_bool)
            .or_else(|| {
                obj.get("status")
                    .and_then(Value::as_str)
                    .map(|s| s.eq_ignore_ascii_case("accepted") || s.eq_ignore_ascii_case("ok"))
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl NodeClient for NodeRpcClient {
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        let response = self.call("getblocktemplate", json!([])).await?;
        BlockTemplate::from_rpc_response(&response)
    }

    async fn submit_block(&self, block_hex: &str) -> Result<bool> {
        let result = self.call("submitblock", json!([block_hex])).await?;
        let accepted = submit_result_accepted(&result);
        if !accepted {
            tracing::warn!("submitblock rejected: {}", result);
        }
        Ok(accepted)
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        let result = self.call("validateaddress", json!([address])).await?;
        Ok(result
            .get("isvalid")
            .and_then(Value::as_bool)
            .or_else(|| result.as_bool())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.is_open);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open);
        }

        breaker.record_failure();
        assert!(breaker.is_open);
        assert!(breaker.check().is_err());

        breaker.last_failure = Some(Instant::now() - Duration::from_secs(61));
        assert!(breaker.check().is_ok());
        assert!(!breaker.is_open);
    }

    #[test]
    fn test_submit_result_interpretation() {
        assert!(submit_result_accepted(&Value::Null));
        assert!(submit_result_accepted(&json!(true)));
        assert!(submit_result_accepted(&json!({"status": "OK"})));
        assert!(!submit_result_accepted(&json!("high-hash")));
        assert!(!submit_result_accepted(&json!({"accepted": false})));
    }

    #[tokio::test]
    async fn test_rpc_client_creation() {
        let client = NodeRpcClient::new("http://127.0.0.1:8332".to_string(), None, None);
        assert_eq!(client.url(), "http://127.0.0.1:8332");
        assert_eq!(client.timeout, Duration::from_secs(30));
    }
}
