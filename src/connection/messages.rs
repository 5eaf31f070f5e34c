//! Lobby notices and broadcast results

use super::ClientId;

/// Sent to everyone when a client joins
pub const JOIN_NOTICE: &str = "A new player joined!\n";

/// Sent to everyone when a client leaves
pub const LEAVE_NOTICE: &str = "A player has left!\n";

/// Sent to a client right before it is closed for idling
pub const IDLE_NOTICE: &str = "you ded cuz you idled\n";

/// Sent to a connection refused because the lobby is full
pub const FULL_NOTICE: &str = "Server is full, try again later.\n";

/// Format the participant count line broadcast after every join and leave
pub fn player_count_message(count: usize) -> String {
    if count == 1 {
        "1 player is connected.\n".to_string()
    } else {
        format!("{} players are connected.\n", count)
    }
}

/// Outcome of a broadcast
///
/// Broadcast never short-circuits: every client is attempted and the ones
/// that could not be written to are listed in `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<ClientId>,
}

impl BroadcastReport {
    /// True when every client accepted the message
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}
