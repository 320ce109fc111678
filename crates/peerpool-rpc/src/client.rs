//! JSON-RPC 1.0 HTTP client for bitcoind with Basic auth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RpcError;
use crate::types::BlockTemplate;
use crate::BitcoinRpc;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
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

/// Client configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Node URL, e.g. `http://127.0.0.1:18332`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request deadline.
    pub timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Async JSON-RPC client for bitcoind.
pub struct RpcClient {
    client: reqwest::Client,
    config: RpcConfig,
    request_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        Self::with_config(RpcConfig {
            url: url.trim_end_matches('/').to_string(),
            username: (!username.is_empty()).then(|| username.to_string()),
            password: (!password.is_empty()).then(|| password.to_string()),
            ..Default::default()
        })
    }

    pub fn with_config(config: RpcConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(2)
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            config,
            request_id: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            let creds = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            if let Ok(v) = HeaderValue::from_str(&format!("Basic {creds}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        headers
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let req = JsonRpcRequest {
            jsonrpc: "1.0",
            id: self.next_id(),
            method,
            params,
        };

        let resp = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcError::Http {
                method: method.to_string(),
                source: e,
            })?;

        let status = resp.status().as_u16();
        if status == 401 {
            return Err(RpcError::AuthFailed);
        }

        // bitcoind reports RPC-level errors with a 500 status and a JSON
        // body; fall through to envelope parsing for those.
        let body = resp.text().await.map_err(|e| RpcError::Http {
            method: method.to_string(),
            source: e,
        })?;

        let envelope: JsonRpcResponse = serde_json::from_str(&body).map_err(|_| {
            RpcError::HttpStatus {
                method: method.to_string(),
                status,
                body: body.chars().take(500).collect(),
            }
        })?;

        if let Some(err) = envelope.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
                method: method.to_string(),
            });
        }

        envelope
            .result
            .ok_or_else(|| RpcError::NoResult(method.to_string()))
    }
}

impl BitcoinRpc for RpcClient {
    async fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
        let result = self
            .call("getblocktemplate", json!([{"rules": ["segwit"]}]))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn submit_block(&self, block_hex: &str) -> Result<(), RpcError> {
        let result = self.call("submitblock", json!([block_hex])).await;
        match result {
            // submitblock returns null on acceptance, a reason string on
            // rejection.
            Ok(Value::Null) => Ok(()),
            Ok(Value::String(reason)) if !reason.is_empty() => {
                Err(RpcError::BlockRejected { reason })
            }
            Ok(_) => Ok(()),
            Err(RpcError::NoResult(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_block_count(&self) -> Result<i64, RpcError> {
        let result = self.call("getblockcount", json!([])).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_best_block_hash(&self) -> Result<String, RpcError> {
        let result = self.call("getbestblockhash", json!([])).await?;
        Ok(serde_json::from_value(result)?)
    }
}
