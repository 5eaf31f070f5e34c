//! Handler bindings injected by the application
//!
//! The connection manager knows nothing about what clients say. Whatever
//! owns the game logic supplies these hooks; each one is optional and an
//! unset hook simply drops the event.

use std::fmt;
use std::sync::Arc;

use super::Client;

/// Called with every decoded chunk; return `true` when the chunk counts as
/// activity and should renew the client's idle timer
pub type DataHandler = Arc<dyn Fn(&str, &Client) -> bool + Send + Sync>;

/// Called when a client connects or disconnects
pub type ClientHandler = Arc<dyn Fn(&Client) + Send + Sync>;

/// The three optional application hooks
#[derive(Clone, Default)]
pub struct SessionHandlers {
    on_data: Option<DataHandler>,
    on_connect: Option<ClientHandler>,
    on_disconnect: Option<ClientHandler>,
}

impl SessionHandlers {
    /// No hooks bound
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_data<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Client) -> bool + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(handler));
        self
    }

    pub fn on_connect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    pub fn on_disconnect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    /// `None` when no data hook is bound
    pub(crate) fn dispatch_data(&self, text: &str, client: &Client) -> Option<bool> {
        self.on_data.as_ref().map(|handler| handler(text, client))
    }

    pub(crate) fn dispatch_connect(&self, client: &Client) {
        if let Some(handler) = &self.on_connect {
            handler(client);
        }
    }

    pub(crate) fn dispatch_disconnect(&self, client: &Client) {
        if let Some(handler) = &self.on_disconnect {
            handler(client);
        }
    }
}

impl fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandlers")
            .field("on_data", &self.on_data.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unbound_handlers_drop_events() {
        let handlers = SessionHandlers::new();
        let (client, _rx) = Client::new(ClientId::new(1), None);

        assert_eq!(handlers.dispatch_data("w", &client), None);
        handlers.dispatch_connect(&client);
        handlers.dispatch_disconnect(&client);
    }

    #[test]
    fn test_data_handler_result_is_returned() {
        let handlers = SessionHandlers::new().on_data(|text, _| text.ends_with('\n'));
        let (client, _rx) = Client::new(ClientId::new(1), None);

        assert_eq!(handlers.dispatch_data("\x1b[", &client), Some(false));
        assert_eq!(handlers.dispatch_data("w\n", &client), Some(true));
    }

    #[test]
    fn test_lifecycle_handlers_receive_client() {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connects);
        let d = Arc::clone(&disconnects);

        let handlers = SessionHandlers::new()
            .on_connect(move |client| {
                assert_eq!(client.id(), ClientId::new(9));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_disconnect(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            });

        let (client, _rx) = Client::new(ClientId::new(9), None);
        handlers.dispatch_connect(&client);
        handlers.dispatch_disconnect(&client);
        handlers.dispatch_disconnect(&client);

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
        assert!(format!("{:?}", handlers).contains("on_data: false"));
    }
}
