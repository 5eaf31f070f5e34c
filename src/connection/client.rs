//! Connected clients and the insertion-ordered client set

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::messages::BroadcastReport;
use crate::error::SessionError;

/// Unique identity of a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Receiving ends of a client's queues, owned by its session task
///
/// Text is written in order; a close request preempts any write that is
/// stuck on a peer that stopped reading.
#[derive(Debug)]
pub(crate) struct Mailbox {
    pub(crate) outbound_rx: mpsc::UnboundedReceiver<String>,
    pub(crate) close_rx: oneshot::Receiver<Option<String>>,
}

/// Shared handle to a client, as passed to handlers
pub type ClientHandle = Arc<Client>;

/// One accepted, open stream connection
///
/// Writes are queued to the client's session task, so `send` never blocks
/// and can be called from synchronous handlers.
pub struct Client {
    id: ClientId,
    peer_addr: Option<SocketAddr>,
    connected_at: Instant,
    outbound: mpsc::UnboundedSender<String>,
    close_tx: Mutex<Option<oneshot::Sender<Option<String>>>>,
}

impl Client {
    pub(crate) fn new(id: ClientId, peer_addr: Option<SocketAddr>) -> (ClientHandle, Mailbox) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let client = Arc::new(Self {
            id,
            peer_addr,
            connected_at: Instant::now(),
            outbound,
            close_tx: Mutex::new(Some(close_tx)),
        });
        (client, Mailbox { outbound_rx, close_rx })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Remote address, when the client came in over TCP
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// False once the session task has finished
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue text for this client
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.outbound
            .send(text.into())
            .map_err(|_| SessionError::ClientClosed(self.id))
    }

    /// Close the stream
    ///
    /// Text already queued is flushed on a best-effort basis; a peer that
    /// stopped reading does not hold the close up.
    pub fn close(&self) -> Result<(), SessionError> {
        self.request_close(None)
    }

    /// Write a final notice, then close the stream
    ///
    /// The stream is closed even when writing the notice fails or stalls.
    pub fn close_with_notice(&self, notice: impl Into<String>) -> Result<(), SessionError> {
        self.request_close(Some(notice.into()))
    }

    /// Only the first close request is delivered
    fn request_close(&self, notice: Option<String>) -> Result<(), SessionError> {
        let close_tx = self
            .close_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match close_tx {
            Some(close_tx) => close_tx
                .send(notice)
                .map_err(|_| SessionError::ClientClosed(self.id)),
            None => Err(SessionError::ClientClosed(self.id)),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Active clients in the order they joined
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: Vec<ClientHandle>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a client, returning the new size
    pub fn insert(&mut self, client: ClientHandle) -> usize {
        debug_assert!(!self.contains(client.id()), "client inserted twice");
        self.clients.push(client);
        self.clients.len()
    }

    /// Remove exactly the entry with this identity
    pub fn remove(&mut self, id: ClientId) -> Option<ClientHandle> {
        let index = self.clients.iter().position(|c| c.id() == id)?;
        Some(self.clients.remove(index))
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.iter().any(|c| c.id() == id)
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientHandle> {
        self.clients.iter().find(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.id()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientHandle> {
        self.clients.iter()
    }

    /// Queue `message` for every client, never stopping at a failure
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for client in &self.clients {
            match client.send(message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Failed to send broadcast to {}: {}", client.id(), e);
                    report.failed.push(client.id());
                }
            }
        }

        debug!(
            "Broadcast {:?} delivered to {}/{} clients",
            message.trim_end(),
            report.delivered,
            report.attempted()
        );
        report
    }
}
