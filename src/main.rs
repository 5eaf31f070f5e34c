//! Lobby - multi-client TCP session server
//!
//! Runs the connection manager with a minimal set of handlers: input is
//! logged, any line containing a printable character counts as activity, and
//! clients that stay quiet are booted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lobby::{config::ConfigManager, ConnectionManager, SessionHandlers, ShutdownCoordinator};

/// CLI arguments for the lobby server
#[derive(Parser, Debug)]
#[command(name = "lobby")]
#[command(about = "Lobby - multi-client TCP session server")]
#[command(version)]
#[command(long_about = "
Lobby - multi-client TCP session server

Accepts raw TCP clients, announces joins and departures to everyone and
disconnects clients that stay idle.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  LOBBY_BIND_ADDR     - Bind address (e.g., 0.0.0.0:3000)
  LOBBY_IDLE_TIMEOUT  - Idle timeout (e.g., 60s, 2m)
  LOBBY_MAX_CLIENTS   - Maximum connected clients
  LOBBY_BUFFER_SIZE   - Read buffer size in bytes
  LOBBY_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "lobby.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:3000)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Idle timeout (overrides config file)
    #[arg(long, value_parser = humantime::parse_duration, help = "Idle timeout (e.g., 60s, 2m)")]
    pub idle_timeout: Option<Duration>,

    /// Maximum number of connected clients
    #[arg(long, help = "Maximum number of connected clients")]
    pub max_clients: Option<usize>,

    /// Log level (overrides config file)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > environment > config file > defaults
    let mut config = ConfigManager::load(&args.config)?;

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.idle_timeout,
        args.max_clients,
    );
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config.logging.level)?;

    info!("Starting lobby v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!(
            "  Idle timeout: {} (grace {})",
            humantime::format_duration(config.server.idle_timeout),
            humantime::format_duration(config.server.grace_period())
        );
        info!("  Max clients: {}", config.server.max_clients);
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        return Ok(());
    }

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let connection_manager = ConnectionManager::new(Arc::new(config), default_handlers());

    let bound = connection_manager
        .start()
        .await
        .context("Failed to start lobby listener")?;
    info!("Lobby started on {}, press Ctrl+C to stop", bound);

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    shutdown_coordinator
        .shutdown_connection_manager(&connection_manager)
        .await?;

    let stats = connection_manager.stats();
    info!(
        "Server shutdown complete: {} clients served, {} refused, {} idled out",
        stats.total_accepted, stats.total_refused, stats.idle_disconnects
    );

    Ok(())
}

fn default_handlers() -> SessionHandlers {
    SessionHandlers::new()
        .on_connect(|client| {
            debug!("{} connected from {:?}", client.id(), client.peer_addr());
        })
        .on_data(|text, client| {
            debug!("{} sent {:?}", client.id(), text);
            text.chars().any(|c| !c.is_control() && !c.is_whitespace())
        })
        .on_disconnect(|client| {
            debug!("{} disconnected", client.id());
        })
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { configured_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
