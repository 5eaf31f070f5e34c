//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MIN_IDLE_TIMEOUT: Duration = Duration::from_millis(2);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_BUFFER_SIZE: usize = 64;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load the file (or defaults) and layer environment overrides on top
    pub fn load(path: &Path) -> Result<Config> {
        Self::load_with_vars(path, |key| std::env::var(key).ok())
    }

    /// Like `load`, reading `LOBBY_*` overrides from `lookup`
    pub fn load_with_vars<F>(path: &Path, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_from_file(path)?;
        Self::apply_env_overrides(&mut config, lookup)?;
        config
            .validate()
            .with_context(|| "Environment overrides produced an invalid configuration")?;
        Ok(config)
    }

    fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = lookup("LOBBY_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid LOBBY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(timeout) = lookup("LOBBY_IDLE_TIMEOUT") {
            config.server.idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid LOBBY_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Some(max_clients) = lookup("LOBBY_MAX_CLIENTS") {
            config.server.max_clients = max_clients
                .parse::<usize>()
                .with_context(|| format!("Invalid LOBBY_MAX_CLIENTS: {}", max_clients))?;
        }

        if let Some(buffer_size) = lookup("LOBBY_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid LOBBY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(log_level) = lookup("LOBBY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.idle_timeout < MIN_IDLE_TIMEOUT {
            bail!("idle_timeout must be at least {:?}", MIN_IDLE_TIMEOUT);
        }

        if self.server.idle_timeout > MAX_IDLE_TIMEOUT {
            bail!("idle_timeout cannot exceed 24 hours");
        }

        if self.server.max_clients == 0 {
            bail!("max_clients must be greater than 0");
        }

        if self.server.buffer_size < MIN_BUFFER_SIZE {
            bail!("buffer_size must be at least {} bytes", MIN_BUFFER_SIZE);
        }

        if self.server.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        idle_timeout: Option<Duration>,
        max_clients: Option<usize>,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(timeout) = idle_timeout {
            self.server.idle_timeout = timeout;
            tracing::info!(
                "CLI override: idle timeout set to {}",
                humantime::format_duration(timeout)
            );
        }

        if let Some(max_clients) = max_clients {
            self.server.max_clients = max_clients;
            tracing::info!("CLI override: max clients set to {}", max_clients);
        }
    }
}
