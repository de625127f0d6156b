// Connection registry.
//
// Tracks every live channel, its authentication state, its workspace
// binding, and the outbound sender the socket task drains. The registry is
// the single addressing authority: other components refer to connections by
// id and deliver through `send_to`, never by holding a socket.

use std::collections::HashMap;
use std::sync::Arc;

use atelier_common::protocol::ServerMessage;
use atelier_common::types::Identity;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Client metadata captured at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub protocol_version: String,
}

#[derive(Debug)]
struct ConnectionRecord {
    identity: Option<Identity>,
    workspace_id: Option<String>,
    metadata: ClientMetadata,
    connected_at: DateTime<Utc>,
    outbound: Option<mpsc::UnboundedSender<ServerMessage>>,
}

/// Summary handed back when a connection is removed, so the caller can run
/// workspace-leave side effects after the record is gone.
#[derive(Debug)]
pub struct RemovedConnection {
    pub identity: Option<Identity>,
    pub workspace_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new anonymous connection and return its opaque id.
    pub async fn register(&self, metadata: ClientMetadata) -> Uuid {
        let connection_id = Uuid::new_v4();
        let mut guard = self.connections.write().await;
        guard.insert(
            connection_id,
            ConnectionRecord {
                identity: None,
                workspace_id: None,
                metadata,
                connected_at: Utc::now(),
                outbound: None,
            },
        );
        connection_id
    }

    /// Attach the outbound channel drained by this connection's socket task.
    pub async fn register_outbound(
        &self,
        connection_id: Uuid,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        let mut guard = self.connections.write().await;
        match guard.get_mut(&connection_id) {
            Some(record) => {
                record.outbound = Some(sender);
                true
            }
            None => false,
        }
    }

    /// Remove the connection, returning what cleanup needs to know.
    pub async fn remove(&self, connection_id: Uuid) -> Option<RemovedConnection> {
        let mut guard = self.connections.write().await;
        guard.remove(&connection_id).map(|record| RemovedConnection {
            identity: record.identity,
            workspace_id: record.workspace_id,
        })
    }

    /// Bind a verified identity to the connection.
    pub async fn bind_identity(&self, connection_id: Uuid, identity: Identity) -> bool {
        let mut guard = self.connections.write().await;
        match guard.get_mut(&connection_id) {
            Some(record) => {
                record.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    pub async fn identity(&self, connection_id: Uuid) -> Option<Identity> {
        self.connections.read().await.get(&connection_id).and_then(|r| r.identity.clone())
    }

    /// Record which workspace the connection is an active member of.
    /// The workspace store's active-session set is the source of truth;
    /// this binding mirrors it for addressing.
    pub async fn set_workspace(&self, connection_id: Uuid, workspace_id: Option<String>) -> bool {
        let mut guard = self.connections.write().await;
        match guard.get_mut(&connection_id) {
            Some(record) => {
                record.workspace_id = workspace_id;
                true
            }
            None => false,
        }
    }

    pub async fn workspace_for(&self, connection_id: Uuid) -> Option<String> {
        self.connections.read().await.get(&connection_id).and_then(|r| r.workspace_id.clone())
    }

    /// Queue a message for delivery to one connection. Best-effort: returns
    /// false when the connection is gone or its socket task has stopped.
    pub async fn send_to(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        let sender = {
            let guard = self.connections.read().await;
            guard.get(&connection_id).and_then(|record| record.outbound.clone())
        };
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, connection_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn metadata(&self, connection_id: Uuid) -> Option<ClientMetadata> {
        self.connections.read().await.get(&connection_id).map(|r| r.metadata.clone())
    }

    pub async fn connected_at(&self, connection_id: Uuid) -> Option<DateTime<Utc>> {
        self.connections.read().await.get(&connection_id).map(|r| r.connected_at)
    }
}
