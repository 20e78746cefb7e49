//! Capability Aggregator - fans out to every upstream and builds the routing table
//!
//! This is the primary interface the front door uses to publish capabilities.

use crate::session::{Capability, SessionManager, SessionState, UpstreamStatus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Always-present capability that (re)acquires the credential
pub const AUTHENTICATE_CAPABILITY: &str = "authenticate";

/// Published only when no upstream contributed anything
pub const STATUS_CAPABILITY: &str = "status";

/// Where a namespaced capability is dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub upstream: String,
    pub bare_name: String,
}

/// The capability aggregator
pub struct Aggregator {
    sessions: Arc<SessionManager>,
    /// Namespaced name -> route; replaced wholesale on every listing
    routes: RwLock<HashMap<String, Route>>,
}

impl Aggregator {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Query every usable upstream concurrently and publish the merged list.
    ///
    /// Results are ordered by upstream declaration, not completion. Each
    /// upstream runs in its own task so a failure (or panic) in one never
    /// cancels the others.
    pub async fn list_all(&self) -> Vec<Capability> {
        let keys: Vec<String> = self
            .sessions
            .upstreams()
            .iter()
            .filter(|u| !self.sessions.disabled().contains(&u.key))
            .map(|u| u.key.clone())
            .collect();

        debug!("Listing capabilities from {} upstreams", keys.len());

        let handles = keys.iter().map(|key| {
            let sessions = self.sessions.clone();
            let key = key.clone();
            tokio::spawn(async move { sessions.get_capabilities(&key).await })
        });
        let results = join_all(handles).await;

        let mut capabilities = vec![authenticate_capability()];
        let mut routes = HashMap::new();

        for (key, result) in keys.iter().zip(results) {
            let list = match result {
                Ok(list) => list,
                Err(e) => {
                    error!(upstream = %key, "Capability listing task failed: {}", e);
                    continue;
                }
            };

            for capability in list {
                if capability.name == AUTHENTICATE_CAPABILITY
                    || capability.name == STATUS_CAPABILITY
                    || routes.contains_key(&capability.name)
                {
                    warn!(upstream = %key, capability = %capability.name, "Skipping duplicate capability name");
                    continue;
                }
                routes.insert(
                    capability.name.clone(),
                    Route {
                        upstream: capability.upstream.clone(),
                        bare_name: capability.bare_name.clone(),
                    },
                );
                capabilities.push(capability);
            }
        }

        if capabilities.len() == 1 {
            let statuses = self.sessions.statuses().await;
            capabilities.push(status_capability(&statuses));
        }

        info!(
            "Published {} capabilities ({} routed)",
            capabilities.len(),
            routes.len()
        );
        *self.routes.write().await = routes;

        capabilities
    }

    /// Route for a namespaced capability from the last listing
    pub async fn resolve(&self, name: &str) -> Option<Route> {
        self.routes.read().await.get(name).cloned()
    }

    /// Aggregator statistics
    pub async fn stats(&self) -> AggregatorStats {
        let statuses = self.sessions.statuses().await;
        AggregatorStats {
            upstreams: statuses.len(),
            initialized: statuses.iter().filter(|s| s.state == SessionState::Initialized).count(),
            disabled: statuses.iter().filter(|s| s.state == SessionState::Disabled).count(),
            routed_capabilities: self.routes.read().await.len(),
        }
    }
}

/// Aggregator statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub upstreams: usize,
    pub initialized: usize,
    pub disabled: usize,
    pub routed_capabilities: usize,
}

fn synthetic(name: &str, description: String) -> Capability {
    Capability {
        name: name.to_string(),
        description,
        input_schema: json!({ "type": "object", "properties": {} }),
        annotations: None,
        upstream: String::new(),
        bare_name: name.to_string(),
        destructive: false,
    }
}

fn authenticate_capability() -> Capability {
    synthetic(
        AUTHENTICATE_CAPABILITY,
        "Check or refresh the gateway's sign-in. Call this when other capabilities fail with \
         authentication errors; it reports the signed-in account or the steps needed to sign in."
            .to_string(),
    )
}

/// Status capability whose description summarises disabled upstreams
pub fn status_capability(statuses: &[UpstreamStatus]) -> Capability {
    let disabled: Vec<String> = statuses
        .iter()
        .filter(|s| s.state == SessionState::Disabled)
        .map(|s| match &s.reason {
            Some(reason) => format!("{} ({})", s.key, reason),
            None => s.key.clone(),
        })
        .collect();

    let summary = if disabled.is_empty() {
        "No upstream capabilities are currently available.".to_string()
    } else {
        format!(
            "No upstream capabilities are currently available. Disabled: {}.",
            disabled.join("; ")
        )
    };

    synthetic(
        STATUS_CAPABILITY,
        format!("{} Call this to see the state of every upstream.", summary),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(key: &str, state: SessionState, reason: Option<&str>) -> UpstreamStatus {
        UpstreamStatus {
            key: key.into(),
            description: String::new(),
            state,
            capabilities: None,
            reason: reason.map(String::from),
        }
    }

    #[test]
    fn test_status_capability_lists_disabled() {
        let cap = status_capability(&[
            status("crm", SessionState::Disabled, Some("no license")),
            status("erp", SessionState::Uninitialized, None),
        ]);
        assert_eq!(cap.name, STATUS_CAPABILITY);
        assert!(cap.description.contains("crm (no license)"));
        assert!(!cap.description.contains("erp"));
    }

    #[test]
    fn test_authenticate_capability_shape() {
        let cap = authenticate_capability();
        assert_eq!(cap.name, AUTHENTICATE_CAPABILITY);
        assert!(!cap.destructive);
        assert_eq!(cap.to_tool_json()["inputSchema"]["type"], "object");
    }
}
