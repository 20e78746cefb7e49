//! Upstream Client
//!
//! Performs one JSON-RPC call against one upstream over HTTP. Each call:
//!
//! - acquires a bearer credential
//! - opens its own connection (no idle pooling)
//! - streams the body into a bounded buffer, draining past the ceiling
//! - accepts either a plain JSON body or event-stream (`data: ...`) framing
//! - is bounded by a wall-clock timeout

use crate::credential::CredentialSource;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Characters of a bad payload quoted back in protocol errors
const PREVIEW_CHARS: usize = 200;

/// JSON-RPC request sent to an upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        static REQUEST_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(REQUEST_ID.fetch_add(1, Ordering::SeqCst))),
            method: method.to_string(),
            params,
        }
    }

    /// Notification: no id, no response expected
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC response from an upstream
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcError {
    /// Message plus any string detail in `data`
    fn full_message(&self) -> String {
        match &self.data {
            Some(Value::String(detail)) => format!("{} ({})", self.message, detail),
            Some(Value::Null) | None => self.message.clone(),
            Some(other) => format!("{} ({})", self.message, other),
        }
    }
}

/// One request/response exchange with an upstream
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Call `method` and return the JSON-RPC `result`
    async fn call(&self, upstream: &str, address: &str, method: &str, params: Value) -> Result<Value>;

    /// Send a notification; the response body is ignored
    async fn notify(&self, upstream: &str, address: &str, method: &str, params: Value) -> Result<()>;
}

/// HTTP transport used in production
pub struct HttpTransport {
    http_client: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpTransport {
    pub fn new(
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
        max_response_bytes: usize,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            credentials,
            timeout,
            max_response_bytes,
        })
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let credential = self.credentials.acquire().await?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|_| GatewayError::Config("Credential is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// POST the request and return status plus the bounded body
    async fn exchange(&self, upstream: &str, address: &str, request: &RpcRequest) -> Result<(u16, Vec<u8>)> {
        let headers = self.headers().await?;

        debug!(upstream = %upstream, method = %request.method, "Sending upstream request");

        let send = async {
            let response = self
                .http_client
                .post(address)
                .headers(headers)
                .json(request)
                .send()
                .await
                .map_err(|e| transport_error(upstream, e))?;
            let status = response.status().as_u16();
            let body = read_body_with_limit(upstream, response, self.max_response_bytes).await?;
            Ok::<_, GatewayError>((status, body))
        };

        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                upstream: upstream.to_string(),
                duration: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn call(&self, upstream: &str, address: &str, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest::new(method, Some(params));
        let (status, body) = self.exchange(upstream, address, &request).await?;

        if !(200..300).contains(&status) {
            return Err(GatewayError::Http {
                upstream: upstream.to_string(),
                status,
                body: preview(&String::from_utf8_lossy(&body)),
            });
        }

        let payload = parse_body(upstream, &body)?;
        let response: RpcResponse =
            serde_json::from_value(payload).map_err(|e| GatewayError::Protocol {
                upstream: upstream.to_string(),
                message: format!("not a JSON-RPC response: {}", e),
                preview: preview(&String::from_utf8_lossy(&body)),
            })?;

        if let Some(error) = response.error {
            return Err(GatewayError::Rpc {
                upstream: upstream.to_string(),
                code: error.code,
                message: error.full_message(),
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, upstream: &str, address: &str, method: &str, params: Value) -> Result<()> {
        let request = RpcRequest::notification(method, Some(params));
        let (status, body) = self.exchange(upstream, address, &request).await?;

        if !(200..300).contains(&status) {
            return Err(GatewayError::Http {
                upstream: upstream.to_string(),
                status,
                body: preview(&String::from_utf8_lossy(&body)),
            });
        }
        Ok(())
    }
}

fn transport_error(upstream: &str, err: reqwest::Error) -> GatewayError {
    GatewayError::Transport {
        upstream: upstream.to_string(),
        message: err.to_string(),
    }
}

/// Read the body, keeping at most `limit` bytes.
///
/// Once the ceiling is crossed the rest of the stream is still read (and
/// discarded) so the connection ends cleanly, then `TooLarge` is returned.
async fn read_body_with_limit(
    upstream: &str,
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut received: usize = 0;
    let mut overflowed = false;

    while let Some(chunk) = response.chunk().await.map_err(|e| transport_error(upstream, e))? {
        received = received.saturating_add(chunk.len());
        if overflowed {
            continue;
        }
        if received > limit {
            overflowed = true;
            body = Vec::new();
            continue;
        }
        body.extend_from_slice(&chunk);
    }

    if overflowed {
        return Err(GatewayError::TooLarge {
            upstream: upstream.to_string(),
            received,
            limit,
        });
    }
    Ok(body)
}

/// Parse a body as plain JSON or as event-stream framing.
///
/// For event streams the first `data:` payload that parses as JSON wins.
pub fn parse_body(upstream: &str, body: &[u8]) -> Result<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return Ok(value);
    }

    let text = String::from_utf8_lossy(body);
    for line in text.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            if let Ok(value) = serde_json::from_str::<Value>(data.trim()) {
                return Ok(value);
            }
        }
    }

    Err(GatewayError::Protocol {
        upstream: upstream.to_string(),
        message: "response is neither JSON nor an event stream with a JSON payload".to_string(),
        preview: preview(&text),
    })
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_creation() {
        let req = RpcRequest::new("tools/list", None);
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.method, "tools/list");
        assert!(req.id.is_some());

        let next = RpcRequest::new("tools/list", None);
        assert_ne!(req.id, next.id);
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = RpcRequest::notification("notifications/initialized", None);
        let text = serde_json::to_string(&note).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn test_parse_plain_json() {
        let value = parse_body("crm", br#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        assert_eq!(value["result"]["ok"], true);
    }

    #[test]
    fn test_parse_event_stream_takes_first_json_event() {
        let body = b"event: message\ndata: not json\n\ndata: {\"result\":1}\n\ndata: {\"result\":2}\n\n";
        let value = parse_body("crm", body).unwrap();
        assert_eq!(value["result"], 1);
    }

    #[test]
    fn test_parse_event_stream_without_space() {
        let value = parse_body("crm", b"data:{\"result\":\"x\"}\n").unwrap();
        assert_eq!(value["result"], "x");
    }

    #[test]
    fn test_garbage_is_protocol_error_with_preview() {
        let body = "<html>".to_string() + &"x".repeat(500);
        let err = parse_body("crm", body.as_bytes()).unwrap_err();
        match err {
            GatewayError::Protocol { preview, .. } => {
                assert!(preview.starts_with("<html>"));
                assert_eq!(preview.chars().count(), PREVIEW_CHARS);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rpc_error_includes_data() {
        let err = RpcError {
            code: -32000,
            message: "Forbidden".into(),
            data: Some(json!("user has no license")),
        };
        assert_eq!(err.full_message(), "Forbidden (user has no license)");
    }
}
