//! Credential Provider
//!
//! Hands out bearer tokens for upstream calls. Tokens come from, in order:
//!
//! 1. the in-memory cache
//! 2. the persisted credential record (primary path, then legacy path)
//! 3. a silent refresh using the refresh token cached for the record's account
//!
//! The provider is purely reactive: it only refreshes on a cache miss.
//!
//! ## Files
//!
//! Credential record (`credential.json`):
//!
//! ```json
//! {
//!   "access_token": "...",
//!   "expires_at": "2026-01-01T00:00:00Z",
//!   "account": "user@example.com",
//!   "tenant_id": "...",
//!   "client_id": "..."
//! }
//! ```
//!
//! Secret cache (`refresh_cache.json`):
//!
//! ```json
//! { "accounts": { "user@example.com": { "refresh_token": "..." } } }
//! ```

use crate::config::CredentialConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Treat tokens as expired this long before their stated expiry
const EXPIRY_SKEW_SECS: i64 = 300;

/// Lifetime assumed for a freshly refreshed token
const ASSUMED_LIFETIME_SECS: i64 = 45 * 60;

/// Floor on the assumed lifetime; keeps a refreshed token valid at hand-off
const MIN_ASSUMED_LIFETIME_SECS: i64 = EXPIRY_SKEW_SECS + 60;

const IDENTITY_PROVIDER: &str = "identity-provider";

/// A bearer credential shared by all upstream calls
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
    account: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("account", &self.account)
            .finish()
    }
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>, account: Option<String>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            account,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    /// Not expired, allowing for clock skew
    pub fn is_valid(&self) -> bool {
        is_fresh(self.expires_at)
    }
}

fn is_fresh(expires_at: DateTime<Utc>) -> bool {
    expires_at - ChronoDuration::seconds(EXPIRY_SKEW_SECS) > Utc::now()
}

/// Supplies a valid credential on demand
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Return a credential that is valid at hand-off time
    async fn acquire(&self) -> Result<Credential>;

    /// Drop any cached credential so the next `acquire` re-reads or refreshes
    fn invalidate(&self) {}
}

/// Fixed bearer token (e.g. from `OP_GATEWAY_TOKEN`)
#[derive(Debug, Clone)]
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token, Utc::now() + ChronoDuration::days(365 * 100), None),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn acquire(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

/// Persisted credential record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl CredentialRecord {
    fn to_credential(&self) -> Credential {
        Credential::new(self.access_token.clone(), self.expires_at, self.account.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretCache {
    #[serde(default)]
    accounts: HashMap<String, CachedSecret>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSecret {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// File-backed provider with silent refresh
#[derive(Debug)]
pub struct TokenProvider {
    token_file: PathBuf,
    legacy_token_file: PathBuf,
    refresh_cache_file: PathBuf,
    authority: String,
    scope: String,
    cached: RwLock<Option<Credential>>,
    client: Client,
}

impl TokenProvider {
    pub fn new(config: &CredentialConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build token refresh client: {}", e)))?;

        Ok(Self {
            token_file: config.token_file(),
            legacy_token_file: config.legacy_token_file(),
            refresh_cache_file: config.refresh_cache_file(),
            authority: config.authority().trim_end_matches('/').to_string(),
            scope: config.scope(),
            cached: RwLock::new(None),
            client,
        })
    }

    /// Primary credential record path
    pub fn token_file(&self) -> &Path {
        &self.token_file
    }

    fn cached_credential(&self) -> Option<Credential> {
        let cache = self.cached.read().unwrap_or_else(|e| e.into_inner());
        cache.as_ref().filter(|c| c.is_valid()).cloned()
    }

    fn store(&self, credential: Credential) {
        let mut cache = self.cached.write().unwrap_or_else(|e| e.into_inner());
        *cache = Some(credential);
    }

    fn no_credential(&self, detail: &str) -> GatewayError {
        GatewayError::NoCredential {
            remediation: format!(
                "{} Sign in again to write a fresh credential to {}, then call the 'authenticate' capability.",
                detail,
                self.token_file.display()
            ),
        }
    }

    async fn silent_refresh(&self, record: &CredentialRecord) -> Result<Credential> {
        let account = record
            .account
            .as_deref()
            .ok_or_else(|| self.no_credential("Saved credential has no account to refresh."))?;
        let tenant_id = record
            .tenant_id
            .as_deref()
            .ok_or_else(|| self.no_credential("Saved credential has no tenant identity."))?;
        let client_id = record
            .client_id
            .as_deref()
            .ok_or_else(|| self.no_credential("Saved credential has no application identity."))?;

        let mut secrets = read_json::<SecretCache>(&self.refresh_cache_file)
            .await?
            .unwrap_or_default();
        let refresh_token = secrets
            .accounts
            .get(account)
            .map(|s| s.refresh_token.clone())
            .ok_or_else(|| self.no_credential(&format!("No cached sign-in for {}.", account)))?;

        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id);
        info!(account = %account, "Credential expired, attempting silent refresh");

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("refresh_token", refresh_token.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                upstream: IDENTITY_PROVIDER.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Http {
                upstream: IDENTITY_PROVIDER.to_string(),
                status,
                body: body.chars().take(200).collect(),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| GatewayError::Protocol {
            upstream: IDENTITY_PROVIDER.to_string(),
            message: e.to_string(),
            preview: String::new(),
        })?;

        let expires_at = Utc::now() + ChronoDuration::seconds(assumed_lifetime_secs(token.expires_in));
        let refreshed = CredentialRecord {
            access_token: token.access_token,
            expires_at,
            account: Some(account.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            client_id: Some(client_id.to_string()),
        };

        if let Err(e) = write_json(&self.token_file, &refreshed).await {
            warn!("Failed to persist refreshed credential: {}", e);
        }

        if let Some(rotated) = token.refresh_token.filter(|t| *t != refresh_token) {
            secrets.accounts.insert(
                account.to_string(),
                CachedSecret {
                    refresh_token: rotated,
                },
            );
            if let Err(e) = write_json(&self.refresh_cache_file, &secrets).await {
                warn!("Failed to persist rotated refresh token: {}", e);
            }
        }

        info!(account = %account, expires_at = %expires_at, "Silent refresh succeeded");
        Ok(refreshed.to_credential())
    }
}

#[async_trait]
impl CredentialSource for TokenProvider {
    async fn acquire(&self) -> Result<Credential> {
        if let Some(credential) = self.cached_credential() {
            debug!("Using cached credential");
            return Ok(credential);
        }

        // First readable record supplies tenant/application identity for refresh.
        let mut identity: Option<CredentialRecord> = None;
        for path in [&self.token_file, &self.legacy_token_file] {
            match read_json::<CredentialRecord>(path).await {
                Ok(Some(record)) => {
                    if is_fresh(record.expires_at) {
                        debug!("Loaded credential from {}", path.display());
                        let credential = record.to_credential();
                        self.store(credential.clone());
                        return Ok(credential);
                    }
                    debug!("Credential in {} has expired", path.display());
                    if identity.is_none() {
                        identity = Some(record);
                    }
                }
                Ok(None) => debug!("No credential record at {}", path.display()),
                Err(e) => warn!("Ignoring unreadable credential record {}: {}", path.display(), e),
            }
        }

        let record = identity.ok_or_else(|| self.no_credential("No saved sign-in found."))?;

        match self.silent_refresh(&record).await {
            Ok(credential) => {
                self.store(credential.clone());
                Ok(credential)
            }
            Err(e @ GatewayError::NoCredential { .. }) => Err(e),
            Err(e) => {
                warn!("Silent refresh failed: {}", e);
                Err(self.no_credential(&format!("Silent refresh failed ({}).", e)))
            }
        }
    }

    fn invalidate(&self) {
        let mut cache = self.cached.write().unwrap_or_else(|e| e.into_inner());
        if cache.take().is_some() {
            debug!("Dropped cached credential");
        }
    }
}

/// Lifetime to assume for a refreshed token.
///
/// Capped at the default and floored just above the expiry skew; the skew
/// itself is applied once, by `is_fresh`.
fn assumed_lifetime_secs(expires_in: Option<i64>) -> i64 {
    match expires_in {
        Some(secs) => secs.clamp(MIN_ASSUMED_LIFETIME_SECS, ASSUMED_LIFETIME_SECS),
        None => ASSUMED_LIFETIME_SECS,
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}
