//! Gateway front door
//!
//! Serves `tools/list` and `tools/call` for the calling client. Failed
//! invocations come back as normal tool results with `isError: true`; only
//! malformed requests produce JSON-RPC errors.

use crate::aggregator::{Aggregator, AUTHENTICATE_CAPABILITY, STATUS_CAPABILITY};
use crate::client::UpstreamTransport;
use crate::config::GatewayConfig;
use crate::credential::CredentialSource;
use crate::error::GatewayError;
use crate::governor::ResponseGovernor;
use crate::protocol::{text_result, JsonRpcError, McpRequest, McpResponse};
use crate::safety;
use crate::session::{Capability, SessionManager, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SERVER_NAME: &str = "op-gateway";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct GatewayServer {
    aggregator: Arc<Aggregator>,
    governor: ResponseGovernor,
    credentials: Arc<dyn CredentialSource>,
    allow_destructive: bool,
    server_name: String,
}

impl GatewayServer {
    pub fn new(
        config: &GatewayConfig,
        aggregator: Arc<Aggregator>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            aggregator,
            governor: ResponseGovernor::from_limits(&config.limits),
            credentials,
            allow_destructive: config.allow_destructive,
            server_name: config.server_name.clone().unwrap_or_else(|| SERVER_NAME.to_string()),
        }
    }

    /// Wire sessions, aggregator and governor from configuration
    pub fn from_config(
        config: &GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(config, transport));
        let aggregator = Arc::new(Aggregator::new(sessions));
        Self::new(config, aggregator, credentials)
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Handle one request; notifications yield no response
    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        debug!(method = %request.method, "Handling request");

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(&request),
            "notifications/initialized" | "initialized" => return None,
            "ping" => McpResponse::success(request.id.clone(), json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .list_capabilities()
                    .await
                    .iter()
                    .map(Capability::to_tool_json)
                    .collect();
                McpResponse::success(request.id.clone(), json!({ "tools": tools }))
            }
            "tools/call" => self.handle_tools_call(&request).await,
            _ => McpResponse::error(request.id.clone(), JsonRpcError::method_not_found(&request.method)),
        };

        if request.is_notification() {
            return None;
        }
        Some(response)
    }

    fn handle_initialize(&self, request: &McpRequest) -> McpResponse {
        let client_name = request
            .params
            .as_ref()
            .and_then(|p| p.get("clientInfo"))
            .and_then(|ci| ci.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown");

        info!(client = %client_name, "Client connected");

        McpResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false }
                },
                "serverInfo": {
                    "name": self.server_name,
                    "version": SERVER_VERSION
                }
            }),
        )
    }

    async fn handle_tools_call(&self, request: &McpRequest) -> McpResponse {
        let params = request.params.clone().unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::error(
                request.id.clone(),
                JsonRpcError::invalid_params("tools/call requires a string 'name'"),
            );
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let result = self.invoke(name, arguments).await;
        McpResponse::success(request.id.clone(), result)
    }

    /// Publish the aggregated capability list (rebuilds the routing table)
    pub async fn list_capabilities(&self) -> Vec<Capability> {
        self.aggregator.list_all().await
    }

    /// Invoke a capability; always returns a tool result
    pub async fn invoke(&self, name: &str, arguments: Value) -> Value {
        match name {
            AUTHENTICATE_CAPABILITY => return self.authenticate().await,
            STATUS_CAPABILITY => return self.status().await,
            _ => {}
        }

        let Some(route) = self.aggregator.resolve(name).await else {
            return error_result(&GatewayError::UnknownCapability(name.to_string()));
        };

        let sessions = self.aggregator.sessions();
        if let Some(reason) = sessions.disabled().reason(&route.upstream) {
            return error_result(&GatewayError::Disabled {
                upstream: route.upstream,
                reason,
            });
        }

        if !self.allow_destructive {
            if let Some(pattern) = safety::destructive_argument(&arguments) {
                warn!(capability = %name, pattern = %pattern, "Blocked destructive arguments");
                return error_result(&GatewayError::BlockedDestructive {
                    capability: name.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }

        match sessions.call(&route.upstream, &route.bare_name, arguments).await {
            Ok(result) => self.governor.govern(as_tool_result(result), name),
            Err(e) => {
                warn!(capability = %name, "Invocation failed: {}", e);
                if e.is_auth_rejection() {
                    self.credentials.invalidate();
                    return text_result(
                        format!(
                            "{}\n\nThe credential was rejected. Call '{}' and retry.",
                            e, AUTHENTICATE_CAPABILITY
                        ),
                        true,
                    );
                }
                error_result(&e)
            }
        }
    }

    async fn authenticate(&self) -> Value {
        self.credentials.invalidate();
        match self.credentials.acquire().await {
            Ok(credential) => text_result(
                format!(
                    "Authenticated as {}. Credential valid until {}.",
                    credential.account().unwrap_or("the configured identity"),
                    credential.expires_at().to_rfc3339()
                ),
                false,
            ),
            Err(e) => error_result(&e),
        }
    }

    async fn status(&self) -> Value {
        let statuses = self.aggregator.sessions().statuses().await;
        let stats = self.aggregator.stats().await;
        let report = json!({ "stats": stats, "upstreams": statuses });
        text_result(
            serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string()),
            false,
        )
    }
}

fn error_result(err: &GatewayError) -> Value {
    text_result(err.to_string(), true)
}

/// Wrap non-standard upstream results so the client always sees `content`
fn as_tool_result(result: Value) -> Value {
    if result.get("content").is_some() {
        return result;
    }
    match result {
        Value::String(text) => text_result(text, false),
        other => text_result(other.to_string(), false),
    }
}
