//! Gateway error taxonomy
//!
//! Every variant renders a message that is safe to show to the calling client.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No credential available. {remediation}")]
    NoCredential { remediation: String },

    #[error("Upstream '{upstream}' is disabled for this session: {reason}")]
    Disabled { upstream: String, reason: String },

    #[error(
        "Request to '{upstream}' timed out after {}s. Try a narrower query or raise the timeout.",
        .duration.as_secs()
    )]
    Timeout { upstream: String, duration: Duration },

    #[error(
        "Response from '{upstream}' exceeded the {limit} byte limit ({received} bytes received). \
         Narrow the query (filters, smaller page size, fewer columns) and retry."
    )]
    TooLarge {
        upstream: String,
        received: usize,
        limit: usize,
    },

    #[error("Transport error talking to '{upstream}': {message}")]
    Transport { upstream: String, message: String },

    #[error("HTTP {status} from '{upstream}': {body}")]
    Http {
        upstream: String,
        status: u16,
        body: String,
    },

    #[error("Upstream '{upstream}' returned error {code}: {message}")]
    Rpc {
        upstream: String,
        code: i64,
        message: String,
    },

    #[error("Unreadable response from '{upstream}': {message} (payload starts with: {preview:?})")]
    Protocol {
        upstream: String,
        message: String,
        preview: String,
    },

    #[error("Unknown capability '{0}'. Call tools/list to refresh the catalog.")]
    UnknownCapability(String),

    #[error(
        "Blocked '{capability}': arguments look destructive (matched {pattern:?}). \
         Destructive operations are disabled unless the gateway runs with allow_destructive."
    )]
    BlockedDestructive { capability: String, pattern: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for 401/403 rejections
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_duration() {
        let err = GatewayError::Timeout {
            upstream: "crm".into(),
            duration: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn test_auth_rejection() {
        let err = GatewayError::Http {
            upstream: "crm".into(),
            status: 403,
            body: "forbidden".into(),
        };
        assert!(err.is_auth_rejection());

        let err = GatewayError::Http {
            upstream: "crm".into(),
            status: 500,
            body: String::new(),
        };
        assert!(!err.is_auth_rejection());
    }
}
