use anyhow::{Context, Result};
use clap::Parser;
use flow_core::lock::LockManager;
use mcp_protocol::{CadenceRouter, OrchestratorHandler};
use mcp_server::config::Config;
use mcp_server::setup::{initialize_store, load_flow_config};
use mcp_server::telemetry::{init_telemetry, log_config_validation, log_startup_info};
use rmcp::{transport::stdio, ServiceExt};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cadence-mcp")]
#[command(about = "Workflow orchestration MCP server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Database URL override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Flow configuration document path
    #[arg(long, env = "FLOW_CONFIG")]
    flow_config: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Apply database migrations and exit
    #[arg(long)]
    migrate_only: bool,

    /// Validate configuration and the flow document, then exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => Config::from_file(config_file)?,
        None => Config::from_env()?,
    };

    if let Some(ref database_url) = cli.database_url {
        config.database.url = Some(database_url.clone());
    }
    if let Some(ref flow_config) = cli.flow_config {
        config.flows.path = Some(flow_config.clone());
    }
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;
    log_config_validation(&config);
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }
    log_startup_info(&config);

    // A broken flow document must never reach the transition engine.
    let flows = Arc::new(load_flow_config(&config).context("Failed to load flow configuration")?);

    if cli.check_config {
        info!(
            flow_version = flows.version(),
            "configuration check passed"
        );
        return Ok(());
    }

    let store = Arc::new(
        initialize_store(&config)
            .await
            .context("Failed to initialize entity store")?,
    );

    if cli.migrate_only {
        info!("migrations applied, exiting");
        return Ok(());
    }

    let locks = Arc::new(LockManager::new());
    let handler = Arc::new(OrchestratorHandler::new(store, locks, flows));
    let router = CadenceRouter::new(handler);

    info!("Cadence MCP server serving on stdio");
    let service = router
        .serve(stdio())
        .await
        .context("Failed to start MCP service")?;

    tokio::select! {
        result = service.waiting() => {
            match result {
                Ok(reason) => info!(?reason, "MCP service stopped"),
                Err(e) => {
                    error!(error = %e, "MCP service error");
                    std::process::exit(3);
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
        }
    }

    Ok(())
}
