//! Upstream Session Manager
//!
//! Owns per-upstream state and the process-wide disabled set.
//!
//! ```text
//! Uninitialized --handshake ok--------------------> Initialized  (terminal)
//! Uninitialized --handshake license/401/403 error--> Disabled     (terminal)
//! Uninitialized --any other handshake error-------> Uninitialized (error surfaced)
//! ```
//!
//! No lock is held across an upstream call: state is read, the lock is
//! dropped, the call runs, and the outcome is written back. Concurrent
//! writers only ever repeat an idempotent transition.

use crate::client::UpstreamTransport;
use crate::config::{GatewayConfig, UpstreamDescriptor};
use crate::error::{GatewayError, Result};
use crate::safety;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Protocol version offered in the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `tools/list` pages fetched from one upstream
const MAX_LIST_PAGES: usize = 50;

/// Error text that marks an upstream as unusable for this account
const LICENSE_PATTERNS: &[&str] = &[
    "license",
    "licence",
    "unlicensed",
    "entitlement",
    "not entitled",
    "subscription",
    "insufficient privileges",
];

/// Per-upstream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Disabled,
}

/// How a failed handshake or fetch should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// License or permission problem: disable for the rest of the run
    Unavailable,
    /// Anything else: surface it, retry later
    Transient,
}

/// Decide whether a failure permanently disables an upstream
pub fn classify_failure(err: &GatewayError) -> FailureClass {
    if err.is_auth_rejection() {
        return FailureClass::Unavailable;
    }

    match err {
        GatewayError::Rpc { .. } | GatewayError::Http { .. } | GatewayError::Protocol { .. } => {
            let text = err.to_string().to_lowercase();
            if LICENSE_PATTERNS.iter().any(|p| text.contains(p)) {
                FailureClass::Unavailable
            } else {
                FailureClass::Transient
            }
        }
        _ => FailureClass::Transient,
    }
}

/// Tool definition as reported by an upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// A namespaced capability published to the client
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    /// `<prefix>_<bare name>`
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: Option<Value>,
    /// Owning upstream key
    pub upstream: String,
    /// Name as the upstream knows it
    pub bare_name: String,
    pub destructive: bool,
}

impl Capability {
    /// Build from an upstream tool, applying namespace, context and hint
    pub fn from_tool(upstream: &UpstreamDescriptor, tool: ToolDefinition) -> Self {
        let context = if upstream.description.is_empty() {
            upstream.key.as_str()
        } else {
            upstream.description.as_str()
        };
        let bare_description = tool.description.as_deref().unwrap_or("").trim();

        let mut description = format!("[{}] {}", context, bare_description);
        if let Some(hint) = upstream.hint(&tool.name) {
            description.push_str("\n\nHint: ");
            description.push_str(hint);
        }

        Self {
            name: upstream.prefixed_name(&tool.name),
            description: description.trim_end().to_string(),
            input_schema: tool.input_schema,
            annotations: tool.annotations,
            upstream: upstream.key.clone(),
            destructive: safety::is_destructive_name(&tool.name),
            bare_name: tool.name,
        }
    }

    /// MCP `tools/list` entry
    pub fn to_tool_json(&self) -> Value {
        let mut tool = json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        });
        if let Some(annotations) = &self.annotations {
            tool["annotations"] = annotations.clone();
        }
        tool
    }
}

/// Process-wide set of upstreams that are unusable for this run.
///
/// Grows monotonically; each entry keeps the reason it was added.
#[derive(Debug, Default)]
pub struct DisabledSet {
    entries: StdRwLock<HashMap<String, String>>,
}

impl DisabledSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    pub fn reason(&self, key: &str) -> Option<String> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    /// Add a key; returns false if it was already present (first reason wins)
    pub fn insert(&self, key: &str, reason: impl Into<String>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), reason.into());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct UpstreamSession {
    state: SessionState,
    capabilities: Option<Vec<Capability>>,
}

/// Status line for one upstream
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub key: String,
    pub description: String,
    pub state: SessionState,
    pub capabilities: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Owns sessions for every configured upstream
pub struct SessionManager {
    upstreams: Vec<UpstreamDescriptor>,
    transport: Arc<dyn UpstreamTransport>,
    sessions: RwLock<HashMap<String, UpstreamSession>>,
    disabled: DisabledSet,
    allow_destructive: bool,
}

impl SessionManager {
    pub fn new(config: &GatewayConfig, transport: Arc<dyn UpstreamTransport>) -> Self {
        let disabled = DisabledSet::new();
        for key in &config.disabled {
            disabled.insert(key, "disabled by configuration");
        }

        let sessions = config
            .upstreams
            .iter()
            .map(|u| {
                let state = if disabled.contains(&u.key) {
                    SessionState::Disabled
                } else {
                    SessionState::Uninitialized
                };
                (u.key.clone(), UpstreamSession { state, capabilities: None })
            })
            .collect();

        Self {
            upstreams: config.upstreams.clone(),
            transport,
            sessions: RwLock::new(sessions),
            disabled,
            allow_destructive: config.allow_destructive,
        }
    }

    /// Upstreams in declaration order
    pub fn upstreams(&self) -> &[UpstreamDescriptor] {
        &self.upstreams
    }

    pub fn descriptor(&self, key: &str) -> Option<&UpstreamDescriptor> {
        self.upstreams.iter().find(|u| u.key == key)
    }

    pub fn disabled(&self) -> &DisabledSet {
        &self.disabled
    }

    pub async fn state(&self, key: &str) -> Option<SessionState> {
        self.sessions.read().await.get(key).map(|s| s.state)
    }

    fn lookup(&self, key: &str) -> Result<&UpstreamDescriptor> {
        self.descriptor(key)
            .ok_or_else(|| GatewayError::Config(format!("Unknown upstream '{}'", key)))
    }

    /// Move an upstream to Disabled for the rest of the run
    pub async fn disable(&self, key: &str, reason: &str) {
        if self.disabled.insert(key, reason) {
            warn!(upstream = %key, reason = %reason, "Upstream disabled");
        }
        if let Some(session) = self.sessions.write().await.get_mut(key) {
            session.state = SessionState::Disabled;
        }
    }

    /// Perform the handshake once.
    ///
    /// Returns `Ok(false)` when the upstream is (or just became) disabled.
    /// Transient failures are returned as errors and leave the state untouched.
    pub async fn ensure_initialized(&self, key: &str) -> Result<bool> {
        if self.disabled.contains(key) {
            return Ok(false);
        }

        match self.state(key).await {
            Some(SessionState::Initialized) => return Ok(true),
            Some(SessionState::Disabled) => return Ok(false),
            _ => {}
        }

        let upstream = self.lookup(key)?;
        let address = upstream.address();
        info!(upstream = %key, "Initializing upstream session");

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "op-gateway",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        match self.transport.call(key, &address, "initialize", params).await {
            Ok(result) => {
                debug!(upstream = %key, "Handshake result: {}", result);
                if let Err(e) = self
                    .transport
                    .notify(key, &address, "notifications/initialized", json!({}))
                    .await
                {
                    debug!(upstream = %key, "initialized notification failed: {}", e);
                }

                if let Some(session) = self.sessions.write().await.get_mut(key) {
                    if session.state == SessionState::Uninitialized {
                        session.state = SessionState::Initialized;
                    }
                }
                info!(upstream = %key, "Upstream session initialized");
                Ok(true)
            }
            Err(e) => match classify_failure(&e) {
                FailureClass::Unavailable => {
                    self.disable(key, &e.to_string()).await;
                    Ok(false)
                }
                FailureClass::Transient => Err(e),
            },
        }
    }

    /// Capabilities of one upstream, fetched once and cached.
    ///
    /// Never fails: any problem is logged and yields an empty list so that
    /// one broken upstream cannot block the others.
    pub async fn get_capabilities(&self, key: &str) -> Vec<Capability> {
        if let Some(session) = self.sessions.read().await.get(key) {
            if let Some(cached) = &session.capabilities {
                return cached.clone();
            }
        }

        match self.ensure_initialized(key).await {
            Ok(true) => {}
            Ok(false) => return vec![],
            Err(e) => {
                warn!(upstream = %key, "Handshake failed: {}", e);
                return vec![];
            }
        }

        let tools = match self.fetch_tools(key).await {
            Ok(tools) => tools,
            Err(e) => {
                if classify_failure(&e) == FailureClass::Unavailable {
                    self.disable(key, &e.to_string()).await;
                } else {
                    warn!(upstream = %key, "Failed to list capabilities: {}", e);
                }
                return vec![];
            }
        };

        let Some(upstream) = self.descriptor(key) else {
            return vec![];
        };

        let total = tools.len();
        let capabilities: Vec<Capability> = tools
            .into_iter()
            .map(|tool| Capability::from_tool(upstream, tool))
            .filter(|cap| {
                if cap.destructive && !self.allow_destructive {
                    debug!(upstream = %key, capability = %cap.bare_name, "Hiding destructive capability");
                    false
                } else {
                    true
                }
            })
            .collect();

        info!(
            upstream = %key,
            "Loaded {} capabilities ({} hidden as destructive)",
            capabilities.len(),
            total - capabilities.len()
        );

        if let Some(session) = self.sessions.write().await.get_mut(key) {
            session.capabilities = Some(capabilities.clone());
        }
        capabilities
    }

    async fn fetch_tools(&self, key: &str) -> Result<Vec<ToolDefinition>> {
        let upstream = self.lookup(key)?;
        let address = upstream.address();
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.transport.call(key, &address, "tools/list", params).await?;

            let page: Vec<ToolDefinition> = match result.get("tools") {
                Some(list) => serde_json::from_value(list.clone()).map_err(|e| GatewayError::Protocol {
                    upstream: key.to_string(),
                    message: format!("malformed tools/list result: {}", e),
                    preview: list.to_string().chars().take(200).collect(),
                })?,
                None => vec![],
            };
            tools.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(String::from);
            if cursor.is_none() {
                return Ok(tools);
            }
        }

        warn!(upstream = %key, "Stopped paging tools/list after {} pages", MAX_LIST_PAGES);
        Ok(tools)
    }

    /// Invoke a capability by its bare name
    pub async fn call(&self, key: &str, bare_name: &str, arguments: Value) -> Result<Value> {
        if let Some(reason) = self.disabled.reason(key) {
            return Err(GatewayError::Disabled {
                upstream: key.to_string(),
                reason,
            });
        }

        if !self.ensure_initialized(key).await? {
            return Err(GatewayError::Disabled {
                upstream: key.to_string(),
                reason: self.disabled.reason(key).unwrap_or_else(|| "disabled".to_string()),
            });
        }

        let upstream = self.lookup(key)?;
        debug!(upstream = %key, capability = %bare_name, "Calling upstream capability");

        self.transport
            .call(
                key,
                &upstream.address(),
                "tools/call",
                json!({ "name": bare_name, "arguments": arguments }),
            )
            .await
    }

    /// Status of every upstream, in declaration order
    pub async fn statuses(&self) -> Vec<UpstreamStatus> {
        let sessions = self.sessions.read().await;
        self.upstreams
            .iter()
            .map(|u| {
                let session = sessions.get(&u.key);
                UpstreamStatus {
                    key: u.key.clone(),
                    description: u.description.clone(),
                    state: session.map(|s| s.state).unwrap_or(SessionState::Uninitialized),
                    capabilities: session.and_then(|s| s.capabilities.as_ref().map(Vec::len)),
                    reason: self.disabled.reason(&u.key),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(message: &str) -> GatewayError {
        GatewayError::Rpc {
            upstream: "crm".into(),
            code: -32000,
            message: message.into(),
        }
    }

    #[test]
    fn test_classify_license_errors() {
        assert_eq!(
            classify_failure(&rpc("User does not have a valid License for this product")),
            FailureClass::Unavailable
        );
        assert_eq!(
            classify_failure(&rpc("Tenant subscription is not active")),
            FailureClass::Unavailable
        );
        assert_eq!(classify_failure(&rpc("Internal server error")), FailureClass::Transient);
    }

    #[test]
    fn test_classify_auth_status() {
        let err = GatewayError::Http {
            upstream: "crm".into(),
            status: 401,
            body: String::new(),
        };
        assert_eq!(classify_failure(&err), FailureClass::Unavailable);

        let err = GatewayError::Http {
            upstream: "crm".into(),
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(classify_failure(&err), FailureClass::Transient);
    }

    #[test]
    fn test_classify_network_errors_are_transient() {
        let err = GatewayError::Transport {
            upstream: "crm".into(),
            message: "connection refused (license server)".into(),
        };
        assert_eq!(classify_failure(&err), FailureClass::Transient);
    }

    #[test]
    fn test_capability_from_tool() {
        let upstream = UpstreamDescriptor::new("crm", "http://x")
            .with_description("Customer records")
            .with_hint("search", "Filter by account id first");
        let tool = ToolDefinition {
            name: "search".into(),
            description: Some("Search records".into()),
            input_schema: empty_schema(),
            annotations: None,
        };

        let cap = Capability::from_tool(&upstream, tool);
        assert_eq!(cap.name, "crm_search");
        assert_eq!(cap.bare_name, "search");
        assert_eq!(cap.upstream, "crm");
        assert!(!cap.destructive);
        assert_eq!(
            cap.description,
            "[Customer records] Search records\n\nHint: Filter by account id first"
        );
    }

    #[test]
    fn test_destructive_flag() {
        let upstream = UpstreamDescriptor::new("crm", "http://x");
        let tool: ToolDefinition = serde_json::from_value(json!({"name": "delete_record"})).unwrap();
        let cap = Capability::from_tool(&upstream, tool);
        assert!(cap.destructive);
        assert_eq!(cap.input_schema, empty_schema());
    }

    #[test]
    fn test_disabled_set_is_monotonic() {
        let set = DisabledSet::new();
        assert!(set.insert("crm", "no license"));
        assert!(!set.insert("crm", "second reason"));
        assert_eq!(set.reason("crm").as_deref(), Some("no license"));
        assert_eq!(set.len(), 1);
    }
}
