//! op-gateway: MCP Capability Gateway
//!
//! Presents several remote MCP servers to one client as a single server.
//! Each upstream's tools are namespaced under its prefix, routed back to
//! their owner on invocation, and their results bounded in size before
//! reaching the client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        op-gateway                           │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │   Front door (stdio JSON-RPC: tools/list, tools/call) │  │
//! │  │   + authenticate / status                             │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │             │                              │                │
//! │  ┌──────────────────────────┐  ┌─────────────────────────┐  │
//! │  │  Aggregator              │  │  Response Governor      │  │
//! │  │  concurrent fan-out,     │  │  truncate_at / hard_max │  │
//! │  │  routing table           │  │  save-to-file           │  │
//! │  └──────────────────────────┘  └─────────────────────────┘  │
//! │             │                                               │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Session Manager: per-upstream state, disabled set,   │  │
//! │  │  destructive filter                                   │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │             │                                               │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  HTTP client (JSON or SSE body, size cap, timeout)    │  │
//! │  │  + credential provider (cache, files, refresh)        │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use op_gateway::prelude::*;
//!
//! let config = GatewayConfig::load_default(None)?;
//! let credentials: Arc<dyn CredentialSource> = Arc::new(TokenProvider::new(&config.credential)?);
//! let transport = Arc::new(HttpTransport::new(
//!     credentials.clone(),
//!     config.limits.timeout(),
//!     config.limits.max_response_bytes,
//! )?);
//! let server = Arc::new(GatewayServer::from_config(&config, transport, credentials));
//! StdioTransport::new().serve(server).await?;
//! ```

pub mod aggregator;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod governor;
pub mod protocol;
pub mod safety;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports
pub use aggregator::{Aggregator, AggregatorStats, Route};
pub use client::{HttpTransport, UpstreamTransport};
pub use config::{GatewayConfig, LimitsConfig, UpstreamDescriptor};
pub use credential::{Credential, CredentialSource, StaticCredential, TokenProvider};
pub use error::{GatewayError, Result};
pub use governor::ResponseGovernor;
pub use protocol::{McpRequest, McpResponse};
pub use server::GatewayServer;
pub use session::{Capability, SessionManager, SessionState};
pub use transport::{McpHandler, StdioTransport};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::{
        Aggregator, Capability, Credential, CredentialSource, GatewayConfig, GatewayError,
        GatewayServer, HttpTransport, McpRequest, McpResponse, ResponseGovernor, SessionManager,
        StaticCredential, StdioTransport, TokenProvider, UpstreamDescriptor, UpstreamTransport,
    };
    pub use std::sync::Arc;
}
