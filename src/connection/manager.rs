//! Connection Manager Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::client::{Client, ClientHandle, ClientId, ClientSet};
use super::handlers::SessionHandlers;
use super::messages::{
    player_count_message, BroadcastReport, FULL_NOTICE, IDLE_NOTICE, JOIN_NOTICE, LEAVE_NOTICE,
};
use super::session::run_session;
use super::timer::IdleTimers;
use crate::config::Config;
use crate::error::SessionError;
use crate::Result;

/// Counters behind `SessionStats`
#[derive(Debug, Default)]
struct SessionCounters {
    accepted: AtomicU64,
    refused: AtomicU64,
    idle_disconnects: AtomicU64,
    broadcast_failures: AtomicU64,
}

/// Accepts clients, supervises their idle timers and broadcasts to them
///
/// Cloning is cheap and every clone drives the same lobby.
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<Config>,
    clients: Arc<Mutex<ClientSet>>,
    handlers: Arc<RwLock<SessionHandlers>>,
    idle_timers: Arc<IdleTimers>,
    counters: Arc<SessionCounters>,
    next_client_id: Arc<AtomicU64>,
    bind_addr: Arc<Mutex<Option<SocketAddr>>>,
    accept_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager; nothing listens until `start`
    pub fn new(config: Arc<Config>, handlers: SessionHandlers) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            clients: Arc::new(Mutex::new(ClientSet::new())),
            handlers: Arc::new(RwLock::new(handlers)),
            idle_timers: Arc::new(IdleTimers::new()),
            counters: Arc::new(SessionCounters::default()),
            next_client_id: Arc::new(AtomicU64::new(1)),
            bind_addr: Arc::new(Mutex::new(None)),
            accept_task: Arc::new(Mutex::new(None)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Replace the application hooks
    ///
    /// Takes effect for the next dispatched event on every client.
    pub fn bind_handlers(&self, handlers: SessionHandlers) {
        debug!("Binding session handlers: {:?}", handlers);
        *self.handlers.write().unwrap_or_else(PoisonError::into_inner) = handlers;
    }

    /// Bind the listener and start accepting in the background
    ///
    /// Returns the bound address, which resolves port 0 to the real port.
    pub async fn start(&self) -> Result<SocketAddr> {
        if lock(&self.accept_task).is_some() {
            return Err(SessionError::AlreadyStarted.into());
        }

        let bind_addr = self.config.server.bind_addr;
        info!("Binding TCP listener to {}", bind_addr);

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {}: {}", bind_addr, e);
                return Err(e).with_context(|| format!("Failed to bind {}", bind_addr));
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;

        let mut accept_task = lock(&self.accept_task);
        if accept_task.is_some() {
            return Err(SessionError::AlreadyStarted.into());
        }

        self.shutdown_flag.store(false, Ordering::Relaxed);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let manager = self.clone();
        *accept_task = Some(tokio::spawn(async move {
            manager.accept_connections(listener, shutdown_rx).await;
        }));
        *lock(&self.bind_addr) = Some(local_addr);

        info!(
            "Lobby listening on {} (idle timeout {:?}, grace {:?}, max {} clients)",
            local_addr,
            self.config.server.idle_timeout,
            self.config.server.grace_period(),
            self.config.server.max_clients
        );
        Ok(local_addr)
    }

    /// Main connection acceptance loop
    async fn accept_connections(&self, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Starting connection acceptance loop");

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);

                            if self.shutdown_flag.load(Ordering::Relaxed) {
                                debug!("Rejecting connection from {} due to shutdown", addr);
                                continue;
                            }

                            if self.client_count() >= self.config.server.max_clients {
                                warn!("Lobby full, refusing connection from {}", addr);
                                self.refuse(stream);
                                continue;
                            }

                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                            }

                            self.accept_connection(stream, Some(addr));
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    self.shutdown_flag.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
    }

    fn refuse(&self, mut stream: TcpStream) {
        self.counters.refused.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = stream.write_all(FULL_NOTICE.as_bytes()).await {
                debug!("Full-lobby notice not delivered: {}", e);
            }
            if let Err(e) = stream.shutdown().await {
                debug!("Closing refused connection failed: {}", e);
            }
        });
    }

    /// Register a new client on an already established stream
    ///
    /// The listener calls this for every TCP connection; any other
    /// bidirectional stream works the same way. Must be called from within a
    /// tokio runtime.
    pub fn accept_connection<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> ClientHandle
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = ClientId::new(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let (client, mailbox) = Client::new(id, peer_addr);

        {
            let mut clients = lock(&self.clients);
            let count = clients.insert(Arc::clone(&client));
            self.arm_idle_timer(&client, self.config.server.grace_period());

            self.record(clients.broadcast(JOIN_NOTICE));
            self.record(clients.broadcast(&player_count_message(count)));
            info!(
                "{} joined from {} ({} connected)",
                id,
                peer_addr.map_or_else(|| "local stream".to_string(), |a| a.to_string()),
                count
            );
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        self.handlers().dispatch_connect(&client);

        tokio::spawn(run_session(
            self.clone(),
            Arc::clone(&client),
            stream,
            mailbox,
            self.config.server.buffer_size,
        ));

        client
    }

    /// Dispatch a decoded chunk to the data hook
    pub fn on_data(&self, client: &ClientHandle, text: &str) {
        match self.handlers().dispatch_data(text, client) {
            Some(true) => {
                trace!("Activity from {}, renewing idle timer", client.id());
                self.arm_idle_timer(client, self.config.server.idle_timeout);
            }
            Some(false) => {
                trace!("Input from {} did not count as activity", client.id());
            }
            None => {
                trace!("No data handler bound, dropped {} bytes from {}", text.len(), client.id());
            }
        }
    }

    /// Tear down a client whose stream ended, errored or was closed
    pub fn on_stream_end(&self, client: &ClientHandle) {
        self.idle_timers.cancel(client.id());
        self.handlers().dispatch_disconnect(client);

        let mut clients = lock(&self.clients);
        if clients.remove(client.id()).is_none() {
            debug!("{} already removed", client.id());
            return;
        }

        let count = clients.len();
        self.record(clients.broadcast(LEAVE_NOTICE));
        self.record(clients.broadcast(&player_count_message(count)));
        info!(
            "{} left after {:?} ({} connected)",
            client.id(),
            client.connected_for(),
            count
        );
    }

    /// Boot a client whose idle timer ran out
    ///
    /// Best effort: a client that is already gone is ignored.
    pub fn idle_expire(&self, client: &ClientHandle) {
        match client.close_with_notice(IDLE_NOTICE) {
            Ok(()) => {
                self.counters.idle_disconnects.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{} idled out after {:?}, disconnecting",
                    client.id(),
                    client.connected_for()
                );
            }
            Err(e) => debug!("Idle disconnect of {} skipped: {}", client.id(), e),
        }
    }

    /// Send `message` to every connected client
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let report = lock(&self.clients).broadcast(message);
        self.record(report.clone());
        report
    }

    /// Arm (or re-arm) the client's idle timer
    pub fn arm_idle_timer(&self, client: &ClientHandle, after: Duration) {
        let manager = self.clone();
        let expired = Arc::clone(client);
        self.idle_timers.arm(client.id(), after, move || {
            manager.idle_expire(&expired);
        });
    }

    fn record(&self, report: BroadcastReport) {
        if !report.failed.is_empty() {
            self.counters
                .broadcast_failures
                .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        }
    }

    fn handlers(&self) -> SessionHandlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Connected clients in join order
    pub fn client_ids(&self) -> Vec<ClientId> {
        lock(&self.clients).ids()
    }

    pub fn get_client(&self, id: ClientId) -> Option<ClientHandle> {
        lock(&self.clients).get(id).cloned()
    }

    pub fn has_idle_timer(&self, id: ClientId) -> bool {
        self.idle_timers.is_armed(id)
    }

    /// Get the bind address if the listener is running
    pub fn get_bind_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bind_addr)
    }

    /// Get session statistics
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_clients: self.client_count(),
            total_accepted: self.counters.accepted.load(Ordering::Relaxed),
            total_refused: self.counters.refused.load(Ordering::Relaxed),
            idle_disconnects: self.counters.idle_disconnects.load(Ordering::Relaxed),
            broadcast_failures: self.counters.broadcast_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting new connections
    pub fn initiate_shutdown(&self) {
        info!("Initiating shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No acceptance loop listening for shutdown: {}", e);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Stop listening, close every client and wait for them to go
    pub async fn stop(&self) -> Result<()> {
        let accept_task = lock(&self.accept_task)
            .take()
            .ok_or(SessionError::NotStarted)?;

        self.initiate_shutdown();
        if let Err(e) = accept_task.await {
            if !e.is_cancelled() {
                error!("Acceptance loop failed: {}", e);
            }
        }
        *lock(&self.bind_addr) = None;

        let clients: Vec<ClientHandle> = lock(&self.clients).iter().cloned().collect();
        for client in &clients {
            if let Err(e) = client.close() {
                debug!("{} already closing: {}", client.id(), e);
            }
        }

        self.wait_for_clients_to_close().await;
        self.idle_timers.cancel_all();
        Ok(())
    }

    /// Wait for all client sessions to finish, bounded by the shutdown timeout
    pub async fn wait_for_clients_to_close(&self) {
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let start_time = Instant::now();

        info!(
            "Waiting for {} clients to close (timeout: {:?})",
            self.client_count(),
            shutdown_timeout
        );

        while self.client_count() > 0 && start_time.elapsed() < shutdown_timeout {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let remaining = self.client_count();
        if remaining == 0 {
            info!("All clients closed in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} clients still connected",
                start_time.elapsed(),
                remaining
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active_clients: usize,
    pub total_accepted: u64,
    pub total_refused: u64,
    pub idle_disconnects: u64,
    pub broadcast_failures: u64,
}
