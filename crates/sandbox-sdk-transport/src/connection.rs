//! Connection contract consumed by the session layer.
//!
//! The physical transport (socket, framing, heartbeat, reconnect timer) lives
//! outside this crate. The session layer only needs open/close/message events
//! and a way to send a frame.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use crate::protocol::Envelope;

/// Identifies a registered [`ConnectionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Receives connection events.
///
/// Events are delivered one at a time. Implementations must not block.
pub trait ConnectionHandler: Send + Sync {
    /// The connection (re)opened with a fresh remote session.
    fn on_open(&self, _session_id: &str) {}

    /// A frame arrived.
    fn on_message(&self, _message: &Envelope) {}

    /// The connection dropped. A reconnect may follow.
    fn on_close(&self) {}
}

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,
    #[error("connection closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A reconnecting duplex connection to the remote runner.
pub trait Connection: Send + Sync {
    /// Whether frames can currently be sent.
    fn is_open(&self) -> bool;

    /// Whether the connection is down (and possibly reconnecting).
    fn is_closed(&self) -> bool;

    /// Remote session id, present only while open.
    fn session_id(&self) -> Option<String>;

    /// Register a handler for connection events.
    fn subscribe_handler(&self, handler: Arc<dyn ConnectionHandler>) -> HandlerId;

    /// Remove a handler. Unknown ids are ignored.
    fn unsubscribe_handler(&self, id: HandlerId);

    /// Send one frame.
    ///
    /// # Errors
    /// Returns error if the connection is not open.
    fn send(&self, message: Envelope) -> Result<(), TransportError>;
}

/// Handler registry for [`Connection`] implementations.
///
/// Emitting works on a snapshot, so handlers may register or remove
/// handlers while an event is being delivered.
#[derive(Default)]
pub struct HandlerSet {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Arc<dyn ConnectionHandler>)>>,
}

impl HandlerSet {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn insert(&self, handler: Arc<dyn ConnectionHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, handler));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit_open(&self, session_id: &str) {
        for handler in self.snapshot() {
            handler.on_open(session_id);
        }
    }

    pub fn emit_message(&self, message: &Envelope) {
        for handler in self.snapshot() {
            handler.on_message(message);
        }
    }

    pub fn emit_close(&self) {
        for handler in self.snapshot() {
            handler.on_close();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionHandler>> {
        self.lock().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Arc<dyn ConnectionHandler>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counter {
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ConnectionHandler for Counter {
        fn on_open(&self, _session_id: &str) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_removed_handler_gets_nothing() {
        let set = HandlerSet::new();
        let counter = Arc::new(Counter::default());
        let id = set.insert(counter.clone());

        set.emit_open("s1");
        assert!(set.remove(id));
        set.emit_close();

        assert_eq!(counter.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counter.closes.load(Ordering::SeqCst), 0);
        assert!(!set.remove(id));
    }

    struct SelfRemoving {
        set: Arc<HandlerSet>,
        id: Mutex<Option<HandlerId>>,
    }

    impl ConnectionHandler for SelfRemoving {
        fn on_close(&self) {
            if let Some(id) = self.id.lock().unwrap().take() {
                self.set.remove(id);
            }
        }
    }

    #[test]
    fn test_handler_may_remove_itself_during_emit() {
        let set = Arc::new(HandlerSet::new());
        let handler = Arc::new(SelfRemoving {
            set: Arc::clone(&set),
            id: Mutex::new(None),
        });
        let id = set.insert(handler.clone());
        *handler.id.lock().unwrap() = Some(id);

        set.emit_close();
        assert!(set.is_empty());
    }
}
