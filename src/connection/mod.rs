//! Connection Management Module
//!
//! Handles TCP connection acceptance, the client set, idle supervision and
//! broadcast.

pub mod client;
pub mod handlers;
pub mod manager;
pub mod messages;
mod session;
pub mod text;
pub mod timer;

pub use client::{Client, ClientHandle, ClientId, ClientSet};
pub use handlers::{ClientHandler, DataHandler, SessionHandlers};
pub use manager::{ConnectionManager, SessionStats};
pub use messages::{player_count_message, BroadcastReport};
pub use timer::IdleTimers;
