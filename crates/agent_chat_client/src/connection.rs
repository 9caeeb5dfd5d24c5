//! The duplex connection collaborator and the "current connection" accessor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::error::ConnectionError;

/// Handler invoked with each inbound text frame.
pub type FrameHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A duplex text connection. Sends issued before the connection is open are
/// expected to be queued and flushed in order once open.
pub trait Connection: Send + Sync {
    fn send(&self, text: String) -> Result<(), ConnectionError>;

    /// Register `handler` for inbound frames until the returned
    /// `Subscription` is dropped.
    fn subscribe(&self, handler: FrameHandler) -> Subscription;
}

/// Set of inbound-frame handlers shared by connection implementations.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, FrameHandler)>>,
}

impl Subscribers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(self: &Arc<Self>, handler: FrameHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        Subscription {
            id,
            owner: Arc::downgrade(self),
        }
    }

    /// Deliver `text` to every handler. Handlers run outside the lock so they
    /// may subscribe or unsubscribe re-entrantly.
    pub fn emit(&self, text: &str) {
        let handlers: Vec<FrameHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(text);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(hid, _)| *hid != id);
    }
}

/// Unsubscribes its handler on drop.
pub struct Subscription {
    id: u64,
    owner: Weak<Subscribers>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Accessor for whichever connection is current. Readers resolve it at the
/// moment they transmit, so a reconnect is observed without notification.
#[derive(Clone)]
pub struct ConnectionSlot {
    inner: Arc<RwLock<Arc<dyn Connection>>>,
}

impl ConnectionSlot {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(connection)),
        }
    }

    pub fn current(&self) -> Arc<dyn Connection> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new connection, returning the previous one.
    pub fn replace(&self, connection: Arc<dyn Connection>) -> Arc<dyn Connection> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, connection)
    }

    /// Send on the current connection.
    pub fn send(&self, text: String) -> Result<(), ConnectionError> {
        self.current().send(text)
    }
}

/// In-memory connection: records outbound frames and lets the owner inject
/// inbound ones.
#[derive(Default)]
pub struct LoopbackConnection {
    sent: Mutex<Vec<String>>,
    subscribers: Arc<Subscribers>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sent frames parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Sent frames whose `type` equals `kind`.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent_json()
            .into_iter()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some(kind))
            .collect()
    }

    /// Inject an inbound frame.
    pub fn deliver(&self, text: &str) {
        self.subscribers.emit(text);
    }

    /// When closed, `send` fails with `ConnectionError::Closed`.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Connection for LoopbackConnection {
    fn send(&self, text: String) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
        Ok(())
    }

    fn subscribe(&self, handler: FrameHandler) -> Subscription {
        self.subscribers.add(handler)
    }
}
