//! Configuration for the MCP Gateway
//!
//! Supports loading from JSON/YAML files, with environment variable overrides
//! applied on top.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "OP_GATEWAY_CONFIG";

/// Main configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upstream MCP servers, in declaration order
    #[serde(default)]
    pub upstreams: Vec<UpstreamDescriptor>,

    /// Response size and timing limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Expose and allow destructive capabilities
    #[serde(default)]
    pub allow_destructive: bool,

    /// Upstream keys disabled by the operator before startup
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Credential source settings
    #[serde(default)]
    pub credential: CredentialConfig,

    /// Server name reported to clients
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstreams: vec![],
            limits: LimitsConfig::default(),
            allow_destructive: false,
            disabled: vec![],
            credential: CredentialConfig::default(),
            server_name: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON or YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = if path.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false) {
            serde_yaml::from_str(&content).with_context(|| "Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).with_context(|| "Failed to parse JSON config")?
        };

        info!("Loaded gateway config from {}", path.display());
        Ok(config)
    }

    /// Load from an explicit path, `OP_GATEWAY_CONFIG`, or default paths
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(path);
        }

        let paths = ["/etc/op-gateway/gateway.json", "/etc/op-gateway/gateway.yaml", "gateway.json"];
        for path in paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        info!("No gateway config found, using defaults");
        Ok(Self::default())
    }

    /// Apply `OP_GATEWAY_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("OP_GATEWAY_OUTPUT_DIR") {
            self.limits.output_dir = if dir.trim().is_empty() { None } else { Some(PathBuf::from(dir)) };
        }
        if let Some(v) = lookup("OP_GATEWAY_TRUNCATE_AT") {
            self.limits.truncate_at = parse_number("OP_GATEWAY_TRUNCATE_AT", &v)?;
        }
        if let Some(v) = lookup("OP_GATEWAY_HARD_MAX") {
            self.limits.hard_max = parse_number("OP_GATEWAY_HARD_MAX", &v)?;
        }
        if let Some(v) = lookup("OP_GATEWAY_MAX_RESPONSE_BYTES") {
            self.limits.max_response_bytes = parse_number("OP_GATEWAY_MAX_RESPONSE_BYTES", &v)?;
        }
        if let Some(v) = lookup("OP_GATEWAY_TIMEOUT_SECS") {
            self.limits.timeout_secs = parse_number("OP_GATEWAY_TIMEOUT_SECS", &v)? as u64;
        }
        if let Some(v) = lookup("OP_GATEWAY_ALLOW_DESTRUCTIVE") {
            self.allow_destructive = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("OP_GATEWAY_DISABLED") {
            for key in v.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if !self.disabled.iter().any(|d| d == key) {
                    self.disabled.push(key.to_string());
                }
            }
        }
        if let Some(token) = lookup("OP_GATEWAY_TOKEN") {
            self.credential.static_token = Some(token);
        }
        Ok(())
    }

    /// Check structural consistency
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        let mut prefixes = HashSet::new();

        for upstream in &self.upstreams {
            if upstream.key.trim().is_empty() {
                bail!("Upstream with url '{}' has an empty key", upstream.url);
            }
            if upstream.url.trim().is_empty() {
                bail!("Upstream '{}' has an empty url", upstream.key);
            }
            if !keys.insert(upstream.key.as_str()) {
                bail!("Duplicate upstream key '{}'", upstream.key);
            }
            if !prefixes.insert(upstream.prefix()) {
                bail!("Duplicate namespace prefix '{}' (upstream '{}')", upstream.prefix(), upstream.key);
            }
        }

        for key in &self.disabled {
            if !keys.contains(key.as_str()) {
                warn!("Disabled upstream '{}' is not configured", key);
            }
        }

        if self.limits.truncate_at == 0 {
            bail!("limits.truncate_at must be greater than zero");
        }
        if self.limits.hard_max < self.limits.truncate_at {
            bail!(
                "limits.hard_max ({}) must not be smaller than limits.truncate_at ({})",
                self.limits.hard_max,
                self.limits.truncate_at
            );
        }
        if self.limits.max_response_bytes == 0 {
            bail!("limits.max_response_bytes must be greater than zero");
        }

        Ok(())
    }

    /// Create a builder for programmatic configuration
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("{} must be a non-negative integer, got '{}'", name, value))
}

/// Builder for GatewayConfig
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn upstream(mut self, upstream: UpstreamDescriptor) -> Self {
        self.config.upstreams.push(upstream);
        self
    }

    pub fn truncate_at(mut self, chars: usize) -> Self {
        self.config.limits.truncate_at = chars;
        self
    }

    pub fn hard_max(mut self, chars: usize) -> Self {
        self.config.limits.hard_max = chars;
        self
    }

    pub fn max_response_bytes(mut self, bytes: usize) -> Self {
        self.config.limits.max_response_bytes = bytes;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.limits.timeout_secs = secs;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.limits.output_dir = Some(dir.into());
        self
    }

    pub fn allow_destructive(mut self, allow: bool) -> Self {
        self.config.allow_destructive = allow;
        self
    }

    pub fn disable(mut self, key: &str) -> Self {
        self.config.disabled.push(key.to_string());
        self
    }

    pub fn static_token(mut self, token: &str) -> Self {
        self.config.credential.static_token = Some(token.to_string());
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

/// One upstream MCP server. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    /// Short unique key
    #[serde(alias = "id")]
    pub key: String,

    /// Endpoint URL for JSON-RPC POSTs
    pub url: String,

    /// Namespace prefix for capability names (defaults to the key)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Human-readable description, shown as context on every capability
    #[serde(default)]
    pub description: String,

    /// Advisory hint text keyed by bare capability name
    #[serde(default)]
    pub hints: HashMap<String, String>,
}

impl UpstreamDescriptor {
    pub fn new(key: &str, url: &str) -> Self {
        Self {
            key: key.to_string(),
            url: url.to_string(),
            prefix: None,
            description: String::new(),
            hints: HashMap::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_hint(mut self, bare_name: &str, hint: &str) -> Self {
        self.hints.insert(bare_name.to_string(), hint.to_string());
        self
    }

    /// Effective namespace prefix
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(&self.key)
    }

    /// Apply the namespace to a bare capability name
    pub fn prefixed_name(&self, bare_name: &str) -> String {
        format!("{}_{}", self.prefix(), bare_name)
    }

    /// Advisory hint for a bare capability name
    pub fn hint(&self, bare_name: &str) -> Option<&str> {
        self.hints.get(bare_name).map(String::as_str)
    }

    /// Endpoint with `${VAR}` references resolved
    pub fn address(&self) -> String {
        resolve_env_var(&self.url)
    }
}

/// Response size and timing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Text fields longer than this (in chars) are saved or truncated
    #[serde(default = "default_truncate_at")]
    pub truncate_at: usize,

    /// Without an output dir, only text longer than this is truncated
    #[serde(default = "default_hard_max")]
    pub hard_max: usize,

    /// Hard ceiling on bytes buffered from one upstream response
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Per-call wall-clock timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Directory for oversized response fields
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_truncate_at() -> usize {
    50_000
}

fn default_hard_max() -> usize {
    100_000
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_timeout() -> u64 {
    60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            truncate_at: default_truncate_at(),
            hard_max: default_hard_max(),
            max_response_bytes: default_max_response_bytes(),
            timeout_secs: default_timeout(),
            output_dir: None,
        }
    }
}

impl LimitsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Credential source settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Primary persisted credential record
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Legacy credential record location, read when the primary is unusable
    #[serde(default)]
    pub legacy_token_file: Option<PathBuf>,

    /// Long-lived secret cache keyed by account
    #[serde(default)]
    pub refresh_cache_file: Option<PathBuf>,

    /// Identity provider authority (token endpoint base)
    #[serde(default)]
    pub authority: Option<String>,

    /// Scope requested on silent refresh
    #[serde(default)]
    pub scope: Option<String>,

    /// Fixed bearer token; bypasses the file-backed provider
    #[serde(default)]
    pub static_token: Option<String>,
}

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_SCOPE: &str = "offline_access openid";

impl CredentialConfig {
    fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("op-gateway"))
            .unwrap_or_else(|| PathBuf::from(".op-gateway"))
    }

    pub fn token_file(&self) -> PathBuf {
        self.token_file.clone().unwrap_or_else(|| Self::config_dir().join("credential.json"))
    }

    pub fn legacy_token_file(&self) -> PathBuf {
        self.legacy_token_file.clone().unwrap_or_else(|| Self::config_dir().join("token.json"))
    }

    pub fn refresh_cache_file(&self) -> PathBuf {
        self.refresh_cache_file
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("refresh_cache.json"))
    }

    pub fn authority(&self) -> String {
        self.authority
            .as_deref()
            .map(resolve_env_var)
            .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string())
    }

    pub fn scope(&self) -> String {
        self.scope.clone().unwrap_or_else(|| DEFAULT_SCOPE.to_string())
    }

    /// Static token with `${VAR}` references resolved; empty counts as unset
    pub fn static_token(&self) -> Option<String> {
        self.static_token
            .as_deref()
            .map(resolve_env_var)
            .filter(|t| !t.trim().is_empty() && !t.starts_with("${"))
    }
}

/// Resolve environment variable references like ${VAR_NAME}
pub fn resolve_env_var(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        std::env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}
