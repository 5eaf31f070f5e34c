//! Lobby Library
//!
//! Multi-client TCP session manager: accepts stream connections, keeps the
//! set of connected clients, boots clients that go idle and broadcasts text
//! to everyone. What clients actually say is left to handlers supplied by
//! the application.

pub mod config;
pub mod connection;
pub mod error;
pub mod shutdown;

pub use config::Config;
pub use connection::{Client, ClientHandle, ClientId, ConnectionManager, SessionHandlers};
pub use error::SessionError;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the lobby server
pub type Result<T> = anyhow::Result<T>;
