//! Stdio Transport
//!
//! Line-delimited JSON-RPC: one request per input line, one response per
//! output line. Requests are served sequentially.

use crate::protocol::{JsonRpcError, McpRequest, McpResponse};
use crate::server::GatewayServer;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

/// Anything that can answer a request
#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn handle_request(&self, request: McpRequest) -> Option<McpResponse>;
}

#[async_trait]
impl McpHandler for GatewayServer {
    async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        GatewayServer::handle_request(self, request).await
    }
}

/// Stdio transport - reads JSON-RPC from stdin, writes to stdout
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    pub async fn serve<H: McpHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        info!("Starting stdio transport");
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        serve_lines(handler.as_ref(), stdin, stdout).await?;
        info!("Stdio transport shutting down");
        Ok(())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve requests from `reader` until EOF, writing responses to `writer`
pub async fn serve_lines<H, R, W>(handler: &H, reader: R, mut writer: W) -> Result<()>
where
    H: McpHandler + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        debug!(request = %line, "Received request");

        let response = match parse_request(line) {
            Ok(request) => handler.handle_request(request).await,
            Err(response) => Some(response),
        };

        if let Some(response) = response {
            let response_json = serde_json::to_string(&response)?;
            debug!(bytes = response_json.len(), "Sending response");
            writer.write_all(response_json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }

    Ok(())
}

fn parse_request(line: &str) -> std::result::Result<McpRequest, McpResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        error!(error = %e, "Parse error");
        McpResponse::error(None, JsonRpcError::parse_error(format!("Parse error: {}", e)))
    })?;

    let id = value.get("id").cloned();
    serde_json::from_value::<McpRequest>(value).map_err(|e| {
        error!(error = %e, "Invalid request");
        McpResponse::error(id, JsonRpcError::invalid_request(format!("Invalid request: {}", e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl McpHandler for Echo {
        async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
            if request.is_notification() {
                return None;
            }
            Some(McpResponse::success(request.id, json!({ "method": request.method })))
        }
    }

    async fn run(input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        serve_lines(&Echo, input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_response_per_request() {
        let responses = run(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n",
        )
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["result"]["method"], "tools/list");
    }

    #[tokio::test]
    async fn test_malformed_lines() {
        let responses = run("not json\n{\"id\":7}\n").await;

        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[1]["error"]["code"], -32600);
        assert_eq!(responses[1]["id"], 7);
    }
}
