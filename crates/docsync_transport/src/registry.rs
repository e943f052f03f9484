//! Connection registry and the transport manager.
//!
//! Live connections are tracked in a [`ConnectionRegistry`] owned by the
//! [`TransportManager`], keyed by a generated [`ConnectionId`]. An entry
//! exists from `open` until the connection emits `Closed`.

use crate::config::{ConnectionOptions, TransportConfig};
use crate::connection::{self, ConnectionEvent, ConnectionHandle};
use crate::error::{close_code, CloseStatus, TransportError, TransportResult};
use crate::stream::{Connector, TcpConnector};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Identifies one connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Live connections by ID.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, id: ConnectionId, handle: ConnectionHandle) {
        self.connections.lock().insert(id, handle);
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.lock().get(id).cloned()
    }

    pub(crate) fn remove(&self, id: &ConnectionId) {
        self.connections.lock().remove(id);
    }

    /// Returns true if `id` is live.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().contains_key(id)
    }

    /// Returns the number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns true if no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

/// Opens connections and routes requests to them by ID.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use docsync_transport::{ConnectionOptions, TransportConfig, TransportEvent, TransportManager};
///
/// let manager = TransportManager::new(TransportConfig::default());
/// let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
/// let options = ConnectionOptions::new("ws://localhost:4984/db/_blipsync".parse()?);
/// let id = manager.open(options, events_tx);
///
/// while let Some(event) = events.recv().await {
///     match event.event {
///         TransportEvent::Opened { .. } => manager.send(id, bytes::Bytes::from_static(b"hi"))?,
///         TransportEvent::Received(data) => manager.receive_complete(id, data.len())?,
///         TransportEvent::Closed(status) => {
///             println!("closed: {status}");
///             break;
///         }
///         TransportEvent::WriteCompleted(_) => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct TransportManager {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    registry: ConnectionRegistry,
}

impl TransportManager {
    /// Creates a manager that connects over TCP.
    pub fn new(config: TransportConfig) -> Self {
        let connector = Arc::new(TcpConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Creates a manager with a custom connector.
    pub fn with_connector(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            registry: ConnectionRegistry::new(),
        }
    }

    /// Returns the transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the registry of live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Starts opening a connection. Progress arrives on `events`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionId {
        let id = ConnectionId::generate();
        debug!(connection_id = %id, url = %options.url, "opening connection");
        connection::spawn(
            id,
            options,
            Arc::clone(&self.connector),
            self.config.clone(),
            events,
            self.registry.clone(),
        );
        id
    }

    /// Queues a frame for writing.
    pub fn send(&self, id: ConnectionId, data: Bytes) -> TransportResult<()> {
        self.handle(&id)?.send(data)
    }

    /// Acknowledges `bytes` received bytes as processed.
    pub fn receive_complete(&self, id: ConnectionId, bytes: usize) -> TransportResult<()> {
        self.handle(&id)?.receive_complete(bytes)
    }

    /// Requests a close. Closing an unknown or already-closing connection
    /// is a no-op.
    pub fn close(&self, id: ConnectionId, status: CloseStatus) {
        match self.registry.get(&id) {
            Some(handle) => handle.close(status),
            None => debug!(connection_id = %id, "close for unknown connection ignored"),
        }
    }

    /// Requests a normal close.
    pub fn close_normal(&self, id: ConnectionId) {
        self.close(id, CloseStatus::websocket(close_code::NORMAL, "closed by client"));
    }

    /// Returns true if `id` has not yet closed.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.registry.contains(&id)
    }

    fn handle(&self, id: &ConnectionId) -> TransportResult<ConnectionHandle> {
        self.registry.get(id).ok_or(TransportError::UnknownConnection)
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager")
            .field("config", &self.config)
            .field("connections", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn unknown_connection_errors() {
        let manager = TransportManager::new(TransportConfig::default());
        let id = ConnectionId::generate();
        assert!(matches!(
            manager.send(id, Bytes::from_static(b"x")),
            Err(TransportError::UnknownConnection)
        ));
        assert!(!manager.is_open(id));
        // Closing an unknown ID is ignored.
        manager.close_normal(id);
        assert!(manager.registry().is_empty());
    }
}
