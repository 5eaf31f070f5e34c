//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM / SIGINT and winds the lobby down: the listener stops,
//! every client is closed and the manager waits for their sessions to end.

use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Block until SIGTERM or SIGINT (Ctrl+C on Windows)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

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
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Stop the connection manager, bounded by the shutdown timeout
    pub async fn shutdown_connection_manager(
        &self,
        connection_manager: &ConnectionManager,
    ) -> Result<()> {
        info!(
            "Shutting down lobby with {} connected clients (timeout: {:?})",
            connection_manager.client_count(),
            self.timeout
        );
        let start_time = Instant::now();

        // the manager bounds its own wait; the extra second covers the listener
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), connection_manager.stop())
            .await
        {
            Ok(result) => result?,
            Err(_) => warn!("Connection manager did not stop within {:?}", self.timeout),
        }

        info!("Lobby shutdown finished in {:?}", start_time.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, SessionHandlers};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_connection_manager() {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
        let manager = ConnectionManager::new(Arc::new(config), SessionHandlers::new());
        manager.start().await.unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        coordinator.shutdown_connection_manager(&manager).await.unwrap();

        assert!(manager.get_bind_addr().is_none());
        assert!(manager.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_of_stopped_manager_fails() {
        let manager = ConnectionManager::new(Arc::new(Config::default()), SessionHandlers::new());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        assert!(coordinator.shutdown_connection_manager(&manager).await.is_err());
    }
}
