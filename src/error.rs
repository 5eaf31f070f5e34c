//! Session error types

use thiserror::Error;

use crate::connection::ClientId;

/// Errors surfaced by the connection manager and client handles
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client's session task has finished; nothing more can be written
    #[error("{0} is no longer connected")]
    ClientClosed(ClientId),

    #[error("connection manager is already listening")]
    AlreadyStarted,

    #[error("connection manager is not listening")]
    NotStarted,
}
