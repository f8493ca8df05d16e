//! Connection registry implementation
//!
//! The set of live client connections, keyed by connection id. It is the
//! only state shared between the accept loop, the connection tasks and the
//! broadcasting producer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::entry::ClientHandle;
use super::error::RegistryError;
use super::frame::Packet;

/// Registry of active client connections
///
/// Thread-safe via `RwLock`. Broadcasting only takes the read lock to
/// snapshot subscribers, so it never waits on a connection being inserted
/// or removed for longer than the map update itself.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, Arc<ClientHandle>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection
    ///
    /// Returns an error if a connection with the same id is already present.
    pub async fn insert(&self, handle: Arc<ClientHandle>) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;

        if connections.contains_key(&handle.id()) {
            return Err(RegistryError::DuplicateConnection(handle.id()));
        }

        tracing::debug!(
            connection_id = handle.id(),
            peer = %handle.peer_addr(),
            connections = connections.len() + 1,
            "Connection registered"
        );
        connections.insert(handle.id(), handle);

        Ok(())
    }

    /// Remove a connection
    ///
    /// Only the first call for a given id gets the handle back; later calls
    /// return `None`. Callers use that to run teardown exactly once.
    pub async fn remove(&self, id: u64) -> Option<Arc<ClientHandle>> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&id);

        if removed.is_some() {
            tracing::debug!(
                connection_id = id,
                connections = connections.len(),
                "Connection removed"
            );
        }

        removed
    }

    /// Look up a connection by id
    pub async fn get(&self, id: u64) -> Option<Arc<ClientHandle>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Snapshot of connections that asked for video
    pub async fn subscribers(&self) -> Vec<Arc<ClientHandle>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|handle| handle.wants_video())
            .cloned()
            .collect()
    }

    /// Queue a packet on every subscribed connection
    ///
    /// Never waits on a client. Returns the number of connections the packet
    /// was queued for; a connection whose writer has already gone away is
    /// skipped and left for its own task to tear down.
    pub async fn broadcast(&self, packet: &Packet) -> usize {
        let subscribers = self.subscribers().await;

        subscribers
            .iter()
            .filter(|handle| handle.enqueue(packet.clone()))
            .count()
    }

    /// Remove and return every connection
    pub async fn drain(&self) -> Vec<Arc<ClientHandle>> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no connections are registered
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Whether any connection has subscribed to video
    pub async fn has_subscribers(&self) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|handle| handle.wants_video())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
