//! The server's concurrent connection registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::{ConnectionId, ConnectionState};

/// Mapping from identifier to live connection.
///
/// Safe for concurrent insert, remove and iteration from any completion
/// task. Iteration always works on a point-in-time snapshot, so slow work
/// on the snapshot never holds the lock.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionState>>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, state: Arc<ConnectionState>) {
        let previous = self.connections.lock().insert(state.id(), state);
        debug_assert!(previous.is_none(), "connection id reused");
    }

    /// Remove a connection. Only the first remover gets it back.
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.lock().remove(&id)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.lock().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Identifiers of every registered connection, in ascending order.
    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ConnectionState>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Remove and return every connection.
    pub(crate) fn drain_all(&self) -> Vec<Arc<ConnectionState>> {
        self.connections.lock().drain().map(|(_, state)| state).collect()
    }

    /// Connections whose last read is strictly older than `threshold`.
    pub(crate) fn idle(&self, threshold: Duration, now: Instant) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .values()
            .filter(|state| state.idle_for(now) > threshold)
            .map(|state| state.id())
            .collect()
    }
}
