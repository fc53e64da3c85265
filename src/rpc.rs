use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("POST {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl RpcError {
    /// Transport failures, throttling and server-side faults are worth retrying;
    /// a well-formed JSON-RPC error object is an answer, not an outage.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport { .. } | RpcError::Decode(_) => true,
            RpcError::Http { status, .. } => *status == 429 || *status >= 500,
            RpcError::Rpc { code, .. } => *code == -32603,
        }
    }
}

/// Minimal JSON-RPC 2.0 client over HTTP, shared by the bundler and paymaster
/// clients. Stateless apart from the request id counter, so one instance can be
/// cloned into any number of concurrent pipelines.
#[derive(Debug)]
pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url,
            http,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, id, url = %self.url, "json-rpc request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcError::Transport {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| RpcError::Transport {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        let body: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) if !status.is_success() => {
                return Err(RpcError::Http {
                    status: status.as_u16(),
                    body: text,
                })
            }
            Err(e) => return Err(RpcError::Decode(format!("failed to decode JSON: {e}"))),
        };

        parse_response(status.as_u16(), body)
    }
}

fn parse_response(status: u16, body: Value) -> Result<Value, RpcError> {
    // Bundlers commonly answer JSON-RPC errors with a 4xx/5xx status; the error
    // object is more specific than the status, so look at it first.
    if let Some(err) = body.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(RpcError::Rpc {
            code,
            message,
            data: err.get("data").cloned(),
        });
    }

    if !(200..300).contains(&status) {
        return Err(RpcError::Http {
            status,
            body: body.to_string(),
        });
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| RpcError::Decode("missing result field".to_string()))
}
