//! Connection binding.
//!
//! Tracks every live client connection, the bounded outbound queue that
//! feeds it, and the set of sessions it currently owns. A connection whose
//! queue overflows is cancelled rather than allowed to skip events, so what
//! it did receive is always a prefix of the session log.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionId;

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Default channel capacity for connection output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Statistics about a connection's outbound queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Total events queued successfully.
    pub events_sent: u64,
    /// Events refused because the queue was full or the connection was gone.
    pub events_dropped: u64,
    /// Whether the queue overflowed and the connection was cut.
    pub overflowed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    overflowed: AtomicBool,
}

/// Sending side of one connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl ConnectionHandle {
    /// Creates a new handle and the receiver the transport drains.
    pub fn new(id: ConnectionId) -> (Self, mpsc::Receiver<ServerEvent>) {
        Self::with_capacity(id, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new handle with a specific queue capacity.
    pub fn with_capacity(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ConnectionHandle {
            id,
            tx,
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        };
        (handle, rx)
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Token cancelled when the connection must be torn down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns a snapshot of the queue statistics.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            events_sent: self.counters.sent.load(Ordering::Relaxed),
            events_dropped: self.counters.dropped.load(Ordering::Relaxed),
            overflowed: self.counters.overflowed.load(Ordering::Relaxed),
        }
    }

    /// Queue an event without waiting.
    ///
    /// Returns false when the event was not queued. A full queue cancels the
    /// connection, and no later event is accepted after that.
    pub fn send(&self, event: ServerEvent) -> bool {
        if self.counters.overflowed.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.counters.overflowed.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        connection_id = %self.id,
                        "Outbound queue full, disconnecting slow client"
                    );
                    self.cancel.cancel();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(connection_id = %self.id, "Connection channel closed");
                false
            }
        }
    }

    /// Checks if the connection can no longer receive events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    sessions: HashSet<SessionId>,
}

/// Registry of live connections and the sessions each one owns.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection with no sessions.
    pub fn register(&self, handle: ConnectionHandle) {
        let id = handle.id().clone();
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                handle,
                sessions: HashSet::new(),
            },
        );
        tracing::debug!(connection_id = %id, "Registered connection");
    }

    /// Removes a connection, returning the sessions it owned.
    ///
    /// Returns `None` if the connection was already removed, so teardown
    /// runs once per connection.
    pub fn unregister(&self, id: &ConnectionId) -> Option<(ConnectionHandle, HashSet<SessionId>)> {
        self.connections
            .remove(id)
            .map(|(_, entry)| (entry.handle, entry.sessions))
    }

    /// Returns the handle for a live connection.
    pub fn handle(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.handle.clone())
    }

    /// Records that `id` owns `session_id`. Returns false if the connection
    /// is gone.
    pub fn bind(&self, id: &ConnectionId, session_id: &SessionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut entry) => {
                entry.sessions.insert(session_id.clone());
                true
            }
            None => false,
        }
    }

    /// Forgets that `id` owns `session_id`.
    pub fn unbind(&self, id: &ConnectionId, session_id: &SessionId) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.sessions.remove(session_id);
        }
    }

    /// Sessions currently owned by a connection.
    pub fn sessions_of(&self, id: &ConnectionId) -> Vec<SessionId> {
        self.connections
            .get(id)
            .map(|entry| entry.sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue an event for a connection. Returns false if it was not queued.
    pub fn send(&self, id: &ConnectionId, event: ServerEvent) -> bool {
        match self.handle(id) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Returns the number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Cancels every live connection.
    pub fn cancel_all(&self) {
        for entry in self.connections.iter() {
            entry.handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(n: u64) -> ServerEvent {
        ServerEvent::Pong { timestamp: n }
    }

    #[tokio::test]
    async fn test_handle_send_and_receive() {
        let (handle, mut rx) = ConnectionHandle::new("conn-1".to_string());

        assert!(handle.send(pong(1)));
        assert_eq!(rx.recv().await, Some(pong(1)));
        assert_eq!(handle.stats().events_sent, 1);
    }

    #[tokio::test]
    async fn test_overflow_cancels_and_refuses_later_events() {
        let (handle, mut rx) = ConnectionHandle::with_capacity("slow".to_string(), 2);

        assert!(handle.send(pong(1)));
        assert!(handle.send(pong(2)));
        assert!(!handle.send(pong(3)));
        assert!(handle.cancel_token().is_cancelled());

        // Draining makes room, but the stream must not resume with a gap
        assert_eq!(rx.recv().await, Some(pong(1)));
        assert!(!handle.send(pong(4)));

        let stats = handle.stats();
        assert!(stats.overflowed);
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.events_dropped, 2);
    }

    #[tokio::test]
    async fn test_send_to_closed_receiver() {
        let (handle, rx) = ConnectionHandle::new("gone".to_string());
        drop(rx);

        assert!(!handle.send(pong(1)));
        assert!(handle.is_closed());
        assert!(!handle.stats().overflowed);
    }

    #[test]
    fn test_registry_bind_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new("c1".to_string());
        registry.register(handle);

        assert!(registry.bind(&"c1".to_string(), &"s1".to_string()));
        assert!(registry.bind(&"c1".to_string(), &"s2".to_string()));
        registry.unbind(&"c1".to_string(), &"s1".to_string());
        assert_eq!(registry.sessions_of(&"c1".to_string()), vec!["s2".to_string()]);

        let (_, sessions) = registry.unregister(&"c1".to_string()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(registry.unregister(&"c1".to_string()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bind_unknown_connection() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.bind(&"ghost".to_string(), &"s1".to_string()));
        assert!(registry.sessions_of(&"ghost".to_string()).is_empty());
    }

    #[tokio::test]
    async fn test_registry_send_and_cancel_all() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::new("c1".to_string());
        let token = handle.cancel_token().clone();
        registry.register(handle);

        assert!(registry.send(&"c1".to_string(), pong(9)));
        assert!(!registry.send(&"c2".to_string(), pong(9)));
        assert_eq!(rx.recv().await, Some(pong(9)));

        registry.cancel_all();
        assert!(token.is_cancelled());
        assert_eq!(registry.len(), 1);
    }
}
