//! remote-gateway
//!
//! An SSH server that authenticates users with passwords, routes them to a
//! flow, and relays their sessions to an upstream SSH server.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use remote_gateway::backend::Repository;
use remote_gateway::config::GatewayConfig;
use remote_gateway::ssh::{self, ServerState};
use remote_gateway::upstream::SshConnector;

/// SSH gateway relaying sessions to upstream servers
#[derive(Parser, Debug)]
#[command(name = "remote-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/remote-gateway/gateway.toml")]
    config: PathBuf,

    /// Print a sample configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let config = GatewayConfig::sample()?;
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let repositories = ssh::build_repositories(&config, Arc::new(SshConnector::new()))
        .context("Failed to set up flows")?;

    if cli.check {
        info!(
            "Configuration OK: {} users, {} flows",
            config.users.len(),
            config.flows.len()
        );
        return Ok(());
    }

    if config.flows.is_empty() {
        warn!("No flows configured; every login will be rejected");
    }

    config.ensure_dirs()?;

    info!("Starting remote-gateway");
    info!("  Listen address: {}", config.listen_addr);
    for flow in &config.flows {
        info!("  Flow {}: {} backend", flow.name, flow.backend.tag());
    }

    let server_state = Arc::new(ServerState::new(Arc::new(config), repositories.clone()));

    let result = tokio::select! {
        result = ssh::run_server(server_state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    shutdown(&repositories);
    result
}

fn shutdown(repositories: &[Repository]) {
    for repository in repositories {
        if let Err(e) = repository.release() {
            warn!("Failed to release flow {}: {}", repository.flow(), e);
        }
        if let Err(e) = repository.cleanup() {
            warn!("Failed to clean up flow {}: {}", repository.flow(), e);
        }
    }
}
