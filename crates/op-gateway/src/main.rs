//! op-gateway: MCP Capability Gateway
//!
//! Serves one MCP endpoint over stdio backed by every configured upstream.
//!
//!   op-gateway                                  # config from OP_GATEWAY_CONFIG or defaults
//!   op-gateway --config gateway.yaml            # explicit config file
//!   op-gateway --output-dir /tmp/gateway-out    # save oversized responses to files
//!   op-gateway --disable crm --disable erp      # skip upstreams for this run

use anyhow::Result;
use clap::Parser;
use op_gateway::{
    CredentialSource, GatewayConfig, GatewayServer, HttpTransport, StaticCredential,
    StdioTransport, TokenProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "op-gateway")]
#[command(about = "MCP gateway over multiple upstream servers")]
#[command(version)]
struct Cli {
    /// Config file (JSON or YAML)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for oversized response fields
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Expose and allow destructive capabilities
    #[arg(long)]
    allow_destructive: bool,

    /// Upstream key to disable (repeatable)
    #[arg(long, value_name = "KEY")]
    disable: Vec<String>,

    /// Per-request upstream timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the protocol.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }

    let mut config = GatewayConfig::load_default(cli.config.as_deref())?;
    config.apply_env_overrides()?;

    if let Some(dir) = cli.output_dir {
        config.limits.output_dir = Some(dir);
    }
    if let Some(secs) = cli.timeout_secs {
        config.limits.timeout_secs = secs;
    }
    if cli.allow_destructive {
        config.allow_destructive = true;
    }
    for key in cli.disable {
        if !config.disabled.contains(&key) {
            config.disabled.push(key);
        }
    }
    config.validate()?;

    info!(
        upstreams = config.upstreams.len(),
        disabled = config.disabled.len(),
        allow_destructive = config.allow_destructive,
        "Starting op-gateway"
    );

    let credentials: Arc<dyn CredentialSource> = match config.credential.static_token() {
        Some(token) => {
            info!("Using static bearer token");
            Arc::new(StaticCredential::new(token))
        }
        None => Arc::new(TokenProvider::new(&config.credential)?),
    };

    let transport = Arc::new(HttpTransport::new(
        credentials.clone(),
        config.limits.timeout(),
        config.limits.max_response_bytes,
    )?);

    let server = Arc::new(GatewayServer::from_config(&config, transport, credentials));
    StdioTransport::new().serve(server).await
}
