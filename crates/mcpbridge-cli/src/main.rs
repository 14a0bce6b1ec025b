//! mcpbridge entry point - the composition root.
//!
//! Resolves settings from the environment (flags take precedence), loads
//! the tool configuration, and runs the HTTP server until Ctrl-C or
//! SIGTERM. Any startup error exits non-zero.

use std::path::PathBuf;

use clap::Parser;
use mcpbridge_axum::start_server;
use mcpbridge_core::{BridgeSettings, config_path_from_env, load_tool_spec};

/// Expose a local stdio JSON-RPC (MCP) tool as an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "mcpbridge", version, about)]
struct Cli {
    /// Listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the tool configuration file (overrides MCP_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Spawn the child on first use instead of at startup (overrides LAZY_START)
    #[arg(long)]
    lazy_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut settings = BridgeSettings::from_env()?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if cli.lazy_start {
        settings.lazy_start = true;
    }

    let config_path = cli.config.unwrap_or_else(config_path_from_env);
    let spec = load_tool_spec(&config_path)?;

    start_server(settings, spec).await
}
