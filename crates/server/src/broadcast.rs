// Broadcast fanout.
//
// Delivers one message to every active session of a workspace except the
// exclusions. Delivery is a push onto each recipient's outbound channel, so
// a slow or dead socket never blocks the others; per-recipient ordering
// follows the order broadcasts are issued on the calling task.

use std::sync::Arc;

use atelier_common::protocol::ServerMessage;
use tracing::debug;
use uuid::Uuid;

use crate::registry::ConnectionRegistry;
use crate::workspace::WorkspaceStore;

pub struct BroadcastFanout {
    store: Arc<WorkspaceStore>,
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastFanout {
    pub fn new(store: Arc<WorkspaceStore>, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self { store, registry })
    }

    /// Deliver `message` to every active session in the workspace except
    /// `exclude`. Returns the number of recipients actually reached; failed
    /// deliveries are logged and skipped.
    pub async fn broadcast(
        &self,
        workspace_id: &str,
        message: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> usize {
        let recipients = self.store.active_sessions(workspace_id).await;

        let mut delivered = 0;
        for connection_id in recipients {
            if Some(connection_id) == exclude {
                continue;
            }
            if self.registry.send_to(connection_id, message.clone()).await {
                delivered += 1;
            } else {
                debug!(
                    workspace_id,
                    connection_id = %connection_id,
                    "skipping broadcast to unreachable connection"
                );
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_common::types::{Identity, Role};
    use tokio::sync::mpsc;

    use crate::registry::ClientMetadata;

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            role: Role::Collaborator,
            permissions: Role::Collaborator.default_permissions(),
        }
    }

    async fn member_with_channel(
        store: &WorkspaceStore,
        registry: &ConnectionRegistry,
        workspace_id: &str,
        user: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = registry.register(ClientMetadata::default()).await;
        let (sender, receiver) = mpsc::unbounded_channel();
        registry.register_outbound(connection_id, sender).await;
        store.join(workspace_id, connection_id, &identity(user), None, None).await.unwrap();
        (connection_id, receiver)
    }

    fn test_message() -> ServerMessage {
        ServerMessage::MemberLeft { workspace_id: "w1".into(), user_id: "ghost".into() }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_active_sessions() {
        let store = WorkspaceStore::new(200);
        let registry = ConnectionRegistry::new();
        let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));

        let (_a, mut rx_a) = member_with_channel(&store, &registry, "w1", "alice").await;
        let (_b, mut rx_b) = member_with_channel(&store, &registry, "w1", "bob").await;

        let delivered = fanout.broadcast("w1", &test_message(), None).await;
        assert_eq!(delivered, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn excluded_connection_never_receives() {
        let store = WorkspaceStore::new(200);
        let registry = ConnectionRegistry::new();
        let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));

        let (conn_a, mut rx_a) = member_with_channel(&store, &registry, "w1", "alice").await;
        let (_b, mut rx_b) = member_with_channel(&store, &registry, "w1", "bob").await;
        let (_c, mut rx_c) = member_with_channel(&store, &registry, "w1", "carol").await;

        let delivered = fanout.broadcast("w1", &test_message(), Some(conn_a)).await;
        assert_eq!(delivered, 2);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_recipient_does_not_block_others() {
        let store = WorkspaceStore::new(200);
        let registry = ConnectionRegistry::new();
        let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));

        let (_a, rx_a) = member_with_channel(&store, &registry, "w1", "alice").await;
        let (_b, mut rx_b) = member_with_channel(&store, &registry, "w1", "bob").await;

        // Alice's socket task died: her receiver is gone.
        drop(rx_a);

        let delivered = fanout.broadcast("w1", &test_message(), None).await;
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcasts_are_scoped_to_the_workspace() {
        let store = WorkspaceStore::new(200);
        let registry = ConnectionRegistry::new();
        let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));

        let (_a, mut rx_a) = member_with_channel(&store, &registry, "w1", "alice").await;
        let (_b, mut rx_b) = member_with_channel(&store, &registry, "w2", "bob").await;

        let delivered = fanout.broadcast("w1", &test_message(), None).await;
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_workspace_is_a_noop() {
        let store = WorkspaceStore::new(200);
        let registry = ConnectionRegistry::new();
        let fanout = BroadcastFanout::new(store, registry);
        assert_eq!(fanout.broadcast("nope", &test_message(), None).await, 0);
    }

    #[tokio::test]
    async fn per_recipient_order_matches_issue_order() {
        let store = WorkspaceStore::new(200);
        let registry = ConnectionRegistry::new();
        let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));

        let (_a, mut rx_a) = member_with_channel(&store, &registry, "w1", "alice").await;

        for round in 0..4 {
            let message = ServerMessage::MemberLeft {
                workspace_id: "w1".into(),
                user_id: format!("user-{round}"),
            };
            fanout.broadcast("w1", &message, None).await;
        }

        for round in 0..4 {
            match rx_a.recv().await.unwrap() {
                ServerMessage::MemberLeft { user_id, .. } => {
                    assert_eq!(user_id, format!("user-{round}"));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
