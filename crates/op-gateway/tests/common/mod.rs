//! Shared fixtures: a scripted in-memory upstream transport

#![allow(dead_code)]

use async_trait::async_trait;
use op_gateway::client::UpstreamTransport;
use op_gateway::config::{GatewayConfigBuilder, UpstreamDescriptor};
use op_gateway::credential::{Credential, CredentialSource};
use op_gateway::error::{GatewayError, Result};
use op_gateway::GatewayConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How a scripted step fails
#[derive(Debug, Clone)]
pub enum Failure {
    Rpc(String),
    Status(u16),
    Network,
    Panic,
}

impl Failure {
    fn to_error(&self, upstream: &str) -> GatewayError {
        match self {
            Failure::Rpc(message) => GatewayError::Rpc {
                upstream: upstream.to_string(),
                code: -32000,
                message: message.clone(),
            },
            Failure::Status(status) => GatewayError::Http {
                upstream: upstream.to_string(),
                status: *status,
                body: String::new(),
            },
            Failure::Network => GatewayError::Transport {
                upstream: upstream.to_string(),
                message: "connection refused".to_string(),
            },
            Failure::Panic => unreachable!("panics are raised, not returned"),
        }
    }
}

/// Scripted behaviour of one upstream
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub tools: Vec<Value>,
    pub handshake: Option<Failure>,
    pub listing: Option<Failure>,
    pub invocation: Option<Failure>,
    pub result: Option<Value>,
    pub delay: Duration,
}

impl Script {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Default::default()
        }
    }

    pub fn failing_handshake(failure: Failure) -> Self {
        Self {
            handshake: Some(failure),
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn returning(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn failing_invocation(mut self, failure: Failure) -> Self {
        self.invocation = Some(failure);
        self
    }
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Runs {}", name),
        "inputSchema": { "type": "object", "properties": {} }
    })
}

/// One recorded exchange
#[derive(Debug, Clone)]
pub struct Exchange {
    pub upstream: String,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: HashMap<String, Script>,
    log: Mutex<Vec<Exchange>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, script: Script) -> Self {
        self.scripts.insert(key.to_string(), script);
        self
    }

    pub fn exchanges(&self, upstream: &str) -> Vec<Exchange> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.upstream == upstream)
            .cloned()
            .collect()
    }

    pub fn count(&self, upstream: &str, method: &str) -> usize {
        self.exchanges(upstream).iter().filter(|e| e.method == method).count()
    }

    pub fn total(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    fn record(&self, upstream: &str, method: &str, params: &Value) {
        self.log.lock().unwrap().push(Exchange {
            upstream: upstream.to_string(),
            method: method.to_string(),
            params: params.clone(),
        });
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn call(&self, upstream: &str, _address: &str, method: &str, params: Value) -> Result<Value> {
        self.record(upstream, method, &params);
        let script = self.scripts.get(upstream).cloned().unwrap_or_default();

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        let failure = match method {
            "initialize" => script.handshake.as_ref(),
            "tools/list" => script.listing.as_ref(),
            "tools/call" => script.invocation.as_ref(),
            _ => None,
        };
        if let Some(failure) = failure {
            if let Failure::Panic = failure {
                panic!("scripted panic in {} for {}", method, upstream);
            }
            return Err(failure.to_error(upstream));
        }

        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": upstream, "version": "1.0.0" }
            })),
            "tools/list" => Ok(json!({ "tools": script.tools })),
            "tools/call" => Ok(script.result.clone().unwrap_or_else(|| {
                json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{} ran {}", upstream, params["name"].as_str().unwrap_or(""))
                    }]
                })
            })),
            _ => Ok(Value::Null),
        }
    }

    async fn notify(&self, upstream: &str, _address: &str, method: &str, params: Value) -> Result<()> {
        self.record(upstream, method, &params);
        Ok(())
    }
}

/// Credential source that counts invalidations
#[derive(Default)]
pub struct CountingCredential {
    pub invalidations: AtomicUsize,
}

impl CountingCredential {
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingCredential {
    async fn acquire(&self) -> Result<Credential> {
        Ok(Credential::new(
            "test-token",
            chrono::Utc::now() + chrono::Duration::hours(1),
            Some("tester@example.com".to_string()),
        ))
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Config builder with one upstream per key, prefix = key
pub fn config_with(keys: &[&str]) -> GatewayConfigBuilder {
    keys.iter().fold(GatewayConfig::builder(), |builder, key| {
        builder.upstream(
            UpstreamDescriptor::new(key, &format!("http://{}.invalid/mcp", key))
                .with_description(&format!("{} service", key)),
        )
    })
}
