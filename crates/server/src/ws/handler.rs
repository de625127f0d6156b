// Session protocol handler.
//
// One task per socket: drains the outbound channel, reads inbound frames,
// and dispatches them by type. All handler errors become typed `error`
// frames correlated to the request id; only transport failures end the
// connection, and those always run the disconnect cleanup path.

use atelier_common::protocol::{
    decode_client_message, encode_server_message, frame_header, ClientMessage, ServerMessage,
    PROTOCOL_VERSION, SUPPORTED_CLIENT_MESSAGES,
};
use atelier_common::types::{
    CursorPosition, Identity, Permission, PluginDescriptor, TriggerMode, WorkspaceSettings,
};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SessionRouterState, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES};
use crate::error::{ErrorCode, SessionError};
use crate::plugin::PluginError;
use crate::registry::ClientMetadata;
use crate::scheduler::AnalysisRequest;
use crate::workspace::{NewComment, StoreError};

pub(crate) async fn handle_socket(
    state: SessionRouterState,
    mut socket: WebSocket,
    metadata: ClientMetadata,
) {
    let connection_id = state.registry.register(metadata).await;
    info!(connection_id = %connection_id, "connection established");

    let established = ServerMessage::ConnectionEstablished {
        connection_id,
        protocol_version: PROTOCOL_VERSION.to_string(),
        supported_messages: SUPPORTED_CLIENT_MESSAGES.iter().map(|s| s.to_string()).collect(),
        limits: state.limits.clone(),
    };
    if send_server_message(&mut socket, &established).await.is_err() {
        disconnect_cleanup(&state, connection_id).await;
        return;
    }

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
    if !state.registry.register_outbound(connection_id, outbound_sender).await {
        disconnect_cleanup(&state, connection_id).await;
        return;
    }

    // Heartbeat: server pings on a fixed interval, disconnects when the
    // previous ping went unanswered past the timeout.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let overdue = std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > overdue {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if send_server_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let replies = handle_frame(&state, connection_id, &raw_message).await;
                        let mut send_failed = false;
                        for reply in replies {
                            if send_server_message(&mut socket, &reply).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    disconnect_cleanup(&state, connection_id).await;
}

/// Decode one inbound frame and dispatch it. Malformed frames and unknown
/// types never mutate state; they produce a correlated error reply.
pub(crate) async fn handle_frame(
    state: &SessionRouterState,
    connection_id: Uuid,
    raw_message: &str,
) -> Vec<ServerMessage> {
    match decode_client_message(raw_message) {
        Ok(message) => dispatch(state, connection_id, message).await,
        Err(decode_error) => {
            let header = frame_header(raw_message);
            let message = match header.kind.as_deref() {
                Some(kind) if !SUPPORTED_CLIENT_MESSAGES.contains(&kind) => {
                    format!("unknown message type `{kind}`")
                }
                Some(kind) => format!("malformed `{kind}` payload: {decode_error}"),
                None => "frame is not a typed message envelope".to_string(),
            };
            vec![
                SessionError::new(ErrorCode::ValidationFailed, message).into_frame(header.id),
            ]
        }
    }
}

/// Route a typed message to its handler and convert failures into error
/// frames. Returned messages are direct replies to the sender; broadcasts
/// go through the fanout inside the handlers.
pub(crate) async fn dispatch(
    state: &SessionRouterState,
    connection_id: Uuid,
    message: ClientMessage,
) -> Vec<ServerMessage> {
    let (request_id, result) = match message {
        ClientMessage::Authenticate { id, credential } => {
            (id.clone(), handle_authenticate(state, connection_id, id, credential).await)
        }
        ClientMessage::WorkspaceJoin { id, workspace_id, name, settings } => (
            id.clone(),
            handle_workspace_join(state, connection_id, id, workspace_id, name, settings).await,
        ),
        ClientMessage::WorkspaceLeave { id, workspace_id } => {
            (id.clone(), handle_workspace_leave(state, connection_id, id, workspace_id).await)
        }
        ClientMessage::AnalysisRealtime { id, workspace_id, file_path, content, capabilities, mode } => (
            id.clone(),
            handle_analysis_realtime(
                state,
                connection_id,
                id,
                workspace_id,
                file_path,
                content,
                capabilities,
                mode,
            )
            .await,
        ),
        ClientMessage::CollaborationCursor { file_path, cursor } => {
            (None, handle_cursor(state, connection_id, file_path, cursor).await)
        }
        ClientMessage::CollaborationEdit { id, file_path, content, operation, mode } => (
            id.clone(),
            handle_edit(state, connection_id, file_path, content, operation, mode).await,
        ),
        ClientMessage::CollaborationComment { id, file_path, line, kind, body, parent_id } => (
            id.clone(),
            handle_comment(
                state,
                connection_id,
                id,
                NewComment { file_path, line, kind, body, parent_id },
            )
            .await,
        ),
        ClientMessage::CollaborationCommentResolve { id, comment_id, resolved } => (
            id.clone(),
            handle_comment_resolve(state, connection_id, id, comment_id, resolved).await,
        ),
        ClientMessage::CollaborationCommentReact { id, comment_id, emoji } => {
            (id.clone(), handle_comment_react(state, connection_id, id, comment_id, emoji).await)
        }
        ClientMessage::PluginRegister { id, plugin_id, descriptor } => {
            (id.clone(), handle_plugin_register(state, connection_id, id, plugin_id, descriptor).await)
        }
        ClientMessage::PluginExecute { id, plugin_id, action, parameters } => (
            id.clone(),
            handle_plugin_execute(state, connection_id, id, plugin_id, action, parameters).await,
        ),
    };

    match result {
        Ok(replies) => replies,
        Err(error) => vec![error.into_frame(request_id)],
    }
}

type HandlerResult = Result<Vec<ServerMessage>, SessionError>;

async fn require_identity(
    state: &SessionRouterState,
    connection_id: Uuid,
) -> Result<Identity, SessionError> {
    state
        .registry
        .identity(connection_id)
        .await
        .ok_or_else(|| SessionError::from_code(ErrorCode::AuthenticationRequired))
}

async fn require_workspace(
    state: &SessionRouterState,
    connection_id: Uuid,
) -> Result<String, SessionError> {
    state.registry.workspace_for(connection_id).await.ok_or_else(|| {
        SessionError::new(ErrorCode::WorkspaceNotFound, "connection has not joined a workspace")
    })
}

async fn handle_authenticate(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    credential: String,
) -> HandlerResult {
    match state.verifier.verify(&credential).await {
        Ok(identity) => {
            state.registry.bind_identity(connection_id, identity.clone()).await;
            info!(connection_id = %connection_id, user_id = %identity.user_id, "authenticated");
            Ok(vec![ServerMessage::AuthSuccess {
                id: request_id,
                user_id: identity.user_id,
                role: identity.role,
                permissions: identity.permissions,
            }])
        }
        Err(error) => {
            // The connection stays open and anonymous.
            debug!(connection_id = %connection_id, error = %error, "authentication failed");
            Err(SessionError::from_code(ErrorCode::AuthenticationFailed))
        }
    }
}

async fn handle_workspace_join(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    workspace_id: String,
    name: Option<String>,
    settings: Option<WorkspaceSettings>,
) -> HandlerResult {
    let identity = require_identity(state, connection_id).await?;

    // A connection holds one active membership at a time; joining a second
    // workspace implicitly leaves the first.
    if let Some(previous) = state.registry.workspace_for(connection_id).await {
        if previous != workspace_id {
            if let Err(error) = leave_and_notify(state, connection_id, &previous, false).await {
                debug!(workspace_id = %previous, error = %error, "implicit leave was a no-op");
            }
        }
    }

    let outcome = state
        .store
        .join(&workspace_id, connection_id, &identity, name, settings)
        .await
        .map_err(store_error)?;
    state.registry.set_workspace(connection_id, Some(workspace_id.clone())).await;

    state
        .fanout
        .broadcast(
            &workspace_id,
            &ServerMessage::MemberJoined {
                workspace_id: workspace_id.clone(),
                member: outcome.member,
            },
            Some(connection_id),
        )
        .await;

    Ok(vec![ServerMessage::WorkspaceJoined { id: request_id, workspace: outcome.snapshot }])
}

async fn handle_workspace_leave(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    workspace_id: String,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    leave_and_notify(state, connection_id, &workspace_id, false)
        .await
        .map_err(store_error)?;
    Ok(vec![ServerMessage::WorkspaceLeft { id: request_id, workspace_id }])
}

/// Shared leave path for deliberate leaves and disconnects. Broadcasts the
/// appropriate member notification to whoever remains.
async fn leave_and_notify(
    state: &SessionRouterState,
    connection_id: Uuid,
    workspace_id: &str,
    disconnected: bool,
) -> Result<(), StoreError> {
    let outcome = state.store.leave(workspace_id, connection_id).await?;
    state.registry.set_workspace(connection_id, None).await;
    if outcome.evicted {
        info!(workspace_id, "last member left; workspace evicted");
        return Ok(());
    }
    let notification = if disconnected {
        ServerMessage::MemberDisconnected {
            workspace_id: workspace_id.to_string(),
            user_id: outcome.user_id,
        }
    } else {
        ServerMessage::MemberLeft {
            workspace_id: workspace_id.to_string(),
            user_id: outcome.user_id,
        }
    };
    state.fanout.broadcast(workspace_id, &notification, Some(connection_id)).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_analysis_realtime(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    workspace_id: Option<String>,
    file_path: String,
    content: String,
    capabilities: Vec<atelier_common::types::Capability>,
    mode: TriggerMode,
) -> HandlerResult {
    let identity = require_identity(state, connection_id).await?;
    if !identity.has_permission(Permission::Analyze) {
        return Err(SessionError::from_code(ErrorCode::NotAuthorized));
    }

    // Workspace-scoped runs must come from an active member, otherwise the
    // summary broadcast would leak activity into foreign workspaces.
    if let Some(workspace_id) = &workspace_id {
        let bound = state.registry.workspace_for(connection_id).await;
        if bound.as_deref() != Some(workspace_id.as_str()) {
            return Err(SessionError::new(
                ErrorCode::NotAuthorized,
                "connection is not an active member of this workspace",
            ));
        }
    }

    state.scheduler.request(
        AnalysisRequest { connection_id, workspace_id, file_path, content, capabilities },
        mode,
        request_id,
    );
    // The `analysis:queued` acknowledgement arrives asynchronously once the
    // scheduler admits the job (immediately, or after the debounce window).
    Ok(Vec::new())
}

async fn handle_cursor(
    state: &SessionRouterState,
    connection_id: Uuid,
    file_path: String,
    cursor: CursorPosition,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    let workspace_id = require_workspace(state, connection_id).await?;

    let user_id = state
        .store
        .update_cursor(&workspace_id, connection_id, &file_path, cursor)
        .await
        .map_err(store_error)?;

    state
        .fanout
        .broadcast(
            &workspace_id,
            &ServerMessage::CursorUpdate {
                workspace_id: workspace_id.clone(),
                user_id,
                file_path,
                cursor,
            },
            Some(connection_id),
        )
        .await;
    Ok(Vec::new())
}

async fn handle_edit(
    state: &SessionRouterState,
    connection_id: Uuid,
    file_path: String,
    content: String,
    operation: atelier_common::types::EditOperation,
    mode: Option<TriggerMode>,
) -> HandlerResult {
    let identity = require_identity(state, connection_id).await?;
    let workspace_id = require_workspace(state, connection_id).await?;

    let file = state
        .store
        .update_file(&workspace_id, connection_id, &file_path, content.clone(), operation)
        .await
        .map_err(store_error)?;

    state
        .fanout
        .broadcast(
            &workspace_id,
            &ServerMessage::EditApplied {
                workspace_id: workspace_id.clone(),
                user_id: identity.user_id,
                file_path: file_path.clone(),
                content: content.clone(),
                version: file.version,
                operation,
            },
            Some(connection_id),
        )
        .await;

    // Live typing arms the debounced analysis trigger.
    if mode == Some(TriggerMode::Auto) {
        state.scheduler.request(
            AnalysisRequest {
                connection_id,
                workspace_id: Some(workspace_id),
                file_path,
                content,
                capabilities: Vec::new(),
            },
            TriggerMode::Auto,
            None,
        );
    }

    Ok(Vec::new())
}

async fn handle_comment(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    new_comment: NewComment,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    let workspace_id = require_workspace(state, connection_id).await?;

    let comment = state
        .store
        .append_comment(&workspace_id, connection_id, new_comment)
        .await
        .map_err(store_error)?;

    state
        .fanout
        .broadcast(
            &workspace_id,
            &ServerMessage::CommentAdded {
                id: None,
                workspace_id: workspace_id.clone(),
                comment: comment.clone(),
            },
            Some(connection_id),
        )
        .await;

    Ok(vec![ServerMessage::CommentAdded { id: request_id, workspace_id, comment }])
}

async fn handle_comment_resolve(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    comment_id: Uuid,
    resolved: bool,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    let workspace_id = require_workspace(state, connection_id).await?;

    let resolved_by = state
        .store
        .resolve_comment(&workspace_id, connection_id, comment_id, resolved)
        .await
        .map_err(store_error)?;

    let broadcast = ServerMessage::CommentResolved {
        id: None,
        workspace_id: workspace_id.clone(),
        comment_id,
        resolved,
        resolved_by: resolved_by.clone(),
    };
    state.fanout.broadcast(&workspace_id, &broadcast, Some(connection_id)).await;

    Ok(vec![ServerMessage::CommentResolved {
        id: request_id,
        workspace_id,
        comment_id,
        resolved,
        resolved_by,
    }])
}

async fn handle_comment_react(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    comment_id: Uuid,
    emoji: String,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    let workspace_id = require_workspace(state, connection_id).await?;

    let count = state
        .store
        .add_reaction(&workspace_id, connection_id, comment_id, &emoji)
        .await
        .map_err(store_error)?;

    let broadcast = ServerMessage::CommentReaction {
        id: None,
        workspace_id: workspace_id.clone(),
        comment_id,
        emoji: emoji.clone(),
        count,
    };
    state.fanout.broadcast(&workspace_id, &broadcast, Some(connection_id)).await;

    Ok(vec![ServerMessage::CommentReaction { id: request_id, workspace_id, comment_id, emoji, count }])
}

async fn handle_plugin_register(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    plugin_id: String,
    descriptor: PluginDescriptor,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    state
        .plugins
        .register(connection_id, &plugin_id, descriptor)
        .await
        .map_err(plugin_error)?;
    Ok(vec![ServerMessage::PluginRegistered { id: request_id, plugin_id }])
}

async fn handle_plugin_execute(
    state: &SessionRouterState,
    connection_id: Uuid,
    request_id: Option<String>,
    plugin_id: String,
    action: String,
    parameters: serde_json::Value,
) -> HandlerResult {
    let _ = require_identity(state, connection_id).await?;
    let result = state
        .plugins
        .execute(connection_id, &plugin_id, &action, parameters)
        .await
        .map_err(plugin_error)?;
    Ok(vec![ServerMessage::PluginResult { id: request_id, plugin_id, action, result }])
}

/// Disconnect cleanup: cancel pending analysis work, drop the registry
/// record, then run workspace-leave side effects for any active membership.
pub(crate) async fn disconnect_cleanup(state: &SessionRouterState, connection_id: Uuid) {
    state.scheduler.cancel_connection(connection_id);

    let Some(removed) = state.registry.remove(connection_id).await else {
        return;
    };
    info!(connection_id = %connection_id, "connection closed");

    if let Some(workspace_id) = removed.workspace_id {
        match state.store.leave(&workspace_id, connection_id).await {
            Ok(outcome) => {
                if outcome.evicted {
                    info!(workspace_id, "last member disconnected; workspace evicted");
                } else {
                    state
                        .fanout
                        .broadcast(
                            &workspace_id,
                            &ServerMessage::MemberDisconnected {
                                workspace_id: workspace_id.clone(),
                                user_id: outcome.user_id,
                            },
                            None,
                        )
                        .await;
                }
            }
            Err(error) => {
                debug!(workspace_id, error = %error, "disconnect leave was a no-op");
            }
        }
    }
}

fn store_error(error: StoreError) -> SessionError {
    let code = match error {
        StoreError::WorkspaceNotFound => ErrorCode::WorkspaceNotFound,
        StoreError::WorkspaceFull => ErrorCode::WorkspaceFull,
        StoreError::NotAuthorized | StoreError::NotAMember => ErrorCode::NotAuthorized,
        StoreError::CommentNotFound => ErrorCode::ValidationFailed,
    };
    SessionError::new(code, error.to_string())
}

fn plugin_error(error: PluginError) -> SessionError {
    let code = match &error {
        PluginError::NotFound => ErrorCode::PluginNotFound,
        PluginError::Engine(_) => ErrorCode::EngineFailure,
        _ => ErrorCode::ValidationFailed,
    };
    SessionError::new(code, error.to_string())
}

async fn send_server_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = encode_server_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("frame exceeds maximum size of {MAX_FRAME_BYTES} bytes").into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use atelier_common::protocol::ServerLimits;
    use atelier_common::types::{CommentKind, EditOperation};

    use crate::auth::StaticTokenVerifier;
    use crate::broadcast::BroadcastFanout;
    use crate::engine::HeuristicEngine;
    use crate::plugin::PluginRegistry;
    use crate::registry::ConnectionRegistry;
    use crate::scheduler::{AnalysisScheduler, DebounceConfig, SchedulerConfig};
    use crate::workspace::WorkspaceStore;

    fn test_state() -> SessionRouterState {
        let registry = ConnectionRegistry::new();
        let store = WorkspaceStore::new(200);
        let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));
        let engine = Arc::new(HeuristicEngine);
        let scheduler = AnalysisScheduler::spawn(
            SchedulerConfig {
                debounce: DebounceConfig::with_millis(100),
                ..Default::default()
            },
            engine.clone(),
            Arc::clone(&registry),
            Arc::clone(&fanout),
        );
        let plugins = PluginRegistry::with_builtins(engine);
        let verifier = Arc::new(StaticTokenVerifier::from_spec(Some(
            "alice-token=alice:collaborator,bob-token=bob:collaborator,eve-token=eve:viewer",
        )));
        SessionRouterState {
            registry,
            store,
            fanout,
            scheduler,
            plugins,
            verifier,
            limits: ServerLimits {
                max_frame_bytes: MAX_FRAME_BYTES,
                debounce_window_ms: 100,
                max_running_jobs: 3,
                max_history_entries: 200,
            },
        }
    }

    struct TestClient {
        connection_id: Uuid,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
    }

    async fn connect(state: &SessionRouterState) -> TestClient {
        let connection_id = state.registry.register(ClientMetadata::default()).await;
        let (sender, outbound) = mpsc::unbounded_channel();
        state.registry.register_outbound(connection_id, sender).await;
        TestClient { connection_id, outbound }
    }

    async fn authenticated(state: &SessionRouterState, token: &str) -> TestClient {
        let client = connect(state).await;
        let replies = dispatch(
            state,
            client.connection_id,
            ClientMessage::Authenticate { id: None, credential: token.into() },
        )
        .await;
        assert!(matches!(replies[0], ServerMessage::AuthSuccess { .. }));
        client
    }

    async fn joined(state: &SessionRouterState, token: &str, workspace: &str) -> TestClient {
        let client = authenticated(state, token).await;
        let replies = dispatch(
            state,
            client.connection_id,
            ClientMessage::WorkspaceJoin {
                id: None,
                workspace_id: workspace.into(),
                name: None,
                settings: None,
            },
        )
        .await;
        assert!(matches!(replies[0], ServerMessage::WorkspaceJoined { .. }));
        client
    }

    fn error_code(message: &ServerMessage) -> &str {
        match message {
            ServerMessage::Error { code, .. } => code.as_str(),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    async fn recv(client: &mut TestClient) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), client.outbound.recv())
            .await
            .expect("timed out waiting for broadcast")
            .expect("outbound channel closed")
    }

    // ── Envelope validation ────────────────────────────────────────

    #[tokio::test]
    async fn unknown_type_yields_correlated_validation_error() {
        let state = test_state();
        let client = connect(&state).await;

        let replies = handle_frame(
            &state,
            client.connection_id,
            r#"{"type":"workspace:rename","id":"req-1","workspace_id":"w1"}"#,
        )
        .await;

        assert_eq!(replies.len(), 1);
        match &replies[0] {
            ServerMessage::Error { id, code, message, .. } => {
                assert_eq!(id.as_deref(), Some("req-1"));
                assert_eq!(code, "VALIDATION_FAILED");
                assert!(message.contains("workspace:rename"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_payload_does_not_mutate_state() {
        let state = test_state();
        let client = authenticated(&state, "alice-token").await;

        // Missing required `workspace_id`.
        let replies = handle_frame(
            &state,
            client.connection_id,
            r#"{"type":"workspace:join","id":"req-2"}"#,
        )
        .await;

        assert_eq!(error_code(&replies[0]), "VALIDATION_FAILED");
        assert!(state.registry.workspace_for(client.connection_id).await.is_none());
    }

    // ── Authentication ─────────────────────────────────────────────

    #[tokio::test]
    async fn bad_credential_leaves_connection_anonymous_and_open() {
        let state = test_state();
        let client = connect(&state).await;

        let replies = dispatch(
            &state,
            client.connection_id,
            ClientMessage::Authenticate { id: Some("a1".into()), credential: "wrong".into() },
        )
        .await;

        match &replies[0] {
            ServerMessage::Error { id, code, .. } => {
                assert_eq!(id.as_deref(), Some("a1"));
                assert_eq!(code, "AUTHENTICATION_FAILED");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(state.registry.is_connected(client.connection_id).await);
        assert!(state.registry.identity(client.connection_id).await.is_none());
    }

    #[tokio::test]
    async fn join_requires_authentication() {
        let state = test_state();
        let client = connect(&state).await;

        let replies = dispatch(
            &state,
            client.connection_id,
            ClientMessage::WorkspaceJoin {
                id: None,
                workspace_id: "w1".into(),
                name: None,
                settings: None,
            },
        )
        .await;
        assert_eq!(error_code(&replies[0]), "AUTHENTICATION_REQUIRED");
    }

    // ── Join / leave ───────────────────────────────────────────────

    #[tokio::test]
    async fn join_notifies_existing_members_and_snapshots_state() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;

        let bob = authenticated(&state, "bob-token").await;
        let replies = dispatch(
            &state,
            bob.connection_id,
            ClientMessage::WorkspaceJoin {
                id: Some("j1".into()),
                workspace_id: "w1".into(),
                name: None,
                settings: None,
            },
        )
        .await;

        match &replies[0] {
            ServerMessage::WorkspaceJoined { id, workspace } => {
                assert_eq!(id.as_deref(), Some("j1"));
                assert_eq!(workspace.member_count, 2);
            }
            other => panic!("expected joined, got {other:?}"),
        }

        match recv(&mut alice).await {
            ServerMessage::MemberJoined { member, .. } => assert_eq!(member.user_id, "bob"),
            other => panic!("expected member_joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_broadcasts_member_left_and_last_leave_evicts() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;
        let bob = joined(&state, "bob-token", "w1").await;
        // Drain Alice's member_joined for Bob.
        let _ = recv(&mut alice).await;

        let replies = dispatch(
            &state,
            bob.connection_id,
            ClientMessage::WorkspaceLeave { id: Some("l1".into()), workspace_id: "w1".into() },
        )
        .await;
        assert!(matches!(&replies[0], ServerMessage::WorkspaceLeft { id, .. } if id.as_deref() == Some("l1")));

        match recv(&mut alice).await {
            ServerMessage::MemberLeft { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("expected member_left, got {other:?}"),
        }

        dispatch(
            &state,
            alice.connection_id,
            ClientMessage::WorkspaceLeave { id: None, workspace_id: "w1".into() },
        )
        .await;
        assert!(!state.store.contains("w1").await);
    }

    #[tokio::test]
    async fn joining_a_second_workspace_leaves_the_first() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;
        let bob = joined(&state, "bob-token", "w1").await;
        let _ = recv(&mut alice).await;

        dispatch(
            &state,
            bob.connection_id,
            ClientMessage::WorkspaceJoin {
                id: None,
                workspace_id: "w2".into(),
                name: None,
                settings: None,
            },
        )
        .await;

        assert_eq!(state.registry.workspace_for(bob.connection_id).await.as_deref(), Some("w2"));
        match recv(&mut alice).await {
            ServerMessage::MemberLeft { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("expected member_left, got {other:?}"),
        }
    }

    // ── Edits and cursors ──────────────────────────────────────────

    #[tokio::test]
    async fn edit_broadcasts_to_others_but_never_echoes_author() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;
        let mut bob = joined(&state, "bob-token", "w1").await;
        let _ = recv(&mut alice).await;

        let replies = dispatch(
            &state,
            alice.connection_id,
            ClientMessage::CollaborationEdit {
                id: None,
                file_path: "main.sol".into(),
                content: "contract A {}".into(),
                operation: EditOperation::Replace,
                mode: None,
            },
        )
        .await;
        assert!(replies.is_empty());

        match recv(&mut bob).await {
            ServerMessage::EditApplied { user_id, version, content, .. } => {
                assert_eq!(user_id, "alice");
                assert_eq!(version, 1);
                assert_eq!(content, "contract A {}");
            }
            other => panic!("expected edit broadcast, got {other:?}"),
        }
        assert!(alice.outbound.try_recv().is_err(), "author must not receive an echo");
    }

    #[tokio::test]
    async fn viewer_edit_is_rejected_with_not_authorized() {
        let state = test_state();
        let _alice = joined(&state, "alice-token", "w1").await;
        let eve = joined(&state, "eve-token", "w1").await;

        let replies = dispatch(
            &state,
            eve.connection_id,
            ClientMessage::CollaborationEdit {
                id: Some("e1".into()),
                file_path: "main.sol".into(),
                content: "evil".into(),
                operation: EditOperation::Replace,
                mode: None,
            },
        )
        .await;
        assert_eq!(error_code(&replies[0]), "NOT_AUTHORIZED");
    }

    #[tokio::test]
    async fn cursor_updates_broadcast_without_direct_reply() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;
        let mut bob = joined(&state, "bob-token", "w1").await;
        let _ = recv(&mut alice).await;

        let replies = dispatch(
            &state,
            alice.connection_id,
            ClientMessage::CollaborationCursor {
                file_path: "main.sol".into(),
                cursor: CursorPosition { line: 10, column: 4, selection: None },
            },
        )
        .await;
        assert!(replies.is_empty());

        match recv(&mut bob).await {
            ServerMessage::CursorUpdate { user_id, cursor, .. } => {
                assert_eq!(user_id, "alice");
                assert_eq!(cursor.line, 10);
            }
            other => panic!("expected cursor broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_edit_triggers_one_debounced_analysis() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;

        for content in ["draft", "final contract text"] {
            dispatch(
                &state,
                alice.connection_id,
                ClientMessage::CollaborationEdit {
                    id: None,
                    file_path: "main.sol".into(),
                    content: content.into(),
                    operation: EditOperation::Replace,
                    mode: Some(TriggerMode::Auto),
                },
            )
            .await;
        }

        assert!(matches!(recv(&mut alice).await, ServerMessage::AnalysisQueued { .. }));
        assert!(matches!(recv(&mut alice).await, ServerMessage::AnalysisStarted { .. }));
        match recv(&mut alice).await {
            ServerMessage::AnalysisCompleted { report, .. } => {
                assert_eq!(report.analyzed_bytes, "final contract text".len());
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(alice.outbound.try_recv().is_err(), "exactly one job must run");
    }

    // ── Comments ───────────────────────────────────────────────────

    #[tokio::test]
    async fn comment_reply_and_broadcast() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;
        let mut bob = joined(&state, "bob-token", "w1").await;
        let _ = recv(&mut alice).await;

        let replies = dispatch(
            &state,
            alice.connection_id,
            ClientMessage::CollaborationComment {
                id: Some("c1".into()),
                file_path: "main.sol".into(),
                line: 7,
                kind: CommentKind::Issue,
                body: "unchecked call".into(),
                parent_id: None,
            },
        )
        .await;

        let comment_id = match &replies[0] {
            ServerMessage::CommentAdded { id, comment, .. } => {
                assert_eq!(id.as_deref(), Some("c1"));
                assert_eq!(comment.author_id, "alice");
                comment.id
            }
            other => panic!("expected comment_added, got {other:?}"),
        };
        match recv(&mut bob).await {
            ServerMessage::CommentAdded { id, comment, .. } => {
                assert!(id.is_none());
                assert_eq!(comment.id, comment_id);
            }
            other => panic!("expected comment broadcast, got {other:?}"),
        }

        let replies = dispatch(
            &state,
            bob.connection_id,
            ClientMessage::CollaborationCommentResolve {
                id: Some("c2".into()),
                comment_id,
                resolved: true,
            },
        )
        .await;
        assert!(matches!(
            &replies[0],
            ServerMessage::CommentResolved { resolved: true, resolved_by, .. } if resolved_by == "bob"
        ));
        assert!(matches!(recv(&mut alice).await, ServerMessage::CommentResolved { .. }));
    }

    // ── Analysis gating ────────────────────────────────────────────

    #[tokio::test]
    async fn workspace_scoped_analysis_requires_membership() {
        let state = test_state();
        let alice = authenticated(&state, "alice-token").await;

        let replies = dispatch(
            &state,
            alice.connection_id,
            ClientMessage::AnalysisRealtime {
                id: Some("a1".into()),
                workspace_id: Some("w1".into()),
                file_path: "main.sol".into(),
                content: "x".into(),
                capabilities: vec![],
                mode: TriggerMode::Immediate,
            },
        )
        .await;
        assert_eq!(error_code(&replies[0]), "NOT_AUTHORIZED");
    }

    // ── Plugins ────────────────────────────────────────────────────

    #[tokio::test]
    async fn plugin_register_and_execute_roundtrip() {
        let state = test_state();
        let alice = authenticated(&state, "alice-token").await;

        let replies = dispatch(
            &state,
            alice.connection_id,
            ClientMessage::PluginExecute {
                id: Some("p1".into()),
                plugin_id: "core-analyzer".into(),
                action: "summarize".into(),
                parameters: serde_json::json!({"content": "selfdestruct(a);"}),
            },
        )
        .await;
        match &replies[0] {
            ServerMessage::PluginResult { id, result, .. } => {
                assert_eq!(id.as_deref(), Some("p1"));
                assert_eq!(result["warning_count"], 1);
            }
            other => panic!("expected plugin result, got {other:?}"),
        }

        let replies = dispatch(
            &state,
            alice.connection_id,
            ClientMessage::PluginExecute {
                id: Some("p2".into()),
                plugin_id: "ghost".into(),
                action: "run".into(),
                parameters: serde_json::Value::Null,
            },
        )
        .await;
        assert_eq!(error_code(&replies[0]), "PLUGIN_NOT_FOUND");
    }

    // ── Disconnect cleanup ─────────────────────────────────────────

    #[tokio::test]
    async fn disconnect_cleans_membership_cursors_and_notifies() {
        let state = test_state();
        let mut alice = joined(&state, "alice-token", "w1").await;
        let bob = joined(&state, "bob-token", "w1").await;
        let _ = recv(&mut alice).await;

        dispatch(
            &state,
            bob.connection_id,
            ClientMessage::CollaborationCursor {
                file_path: "main.sol".into(),
                cursor: CursorPosition { line: 1, column: 1, selection: None },
            },
        )
        .await;
        let _ = recv(&mut alice).await; // cursor broadcast

        disconnect_cleanup(&state, bob.connection_id).await;

        assert!(!state.registry.is_connected(bob.connection_id).await);
        assert!(!state.store.is_active_member("w1", bob.connection_id).await);
        assert!(state.store.cursors_for_connection("w1", bob.connection_id).await.is_empty());
        match recv(&mut alice).await {
            ServerMessage::MemberDisconnected { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("expected member_disconnected, got {other:?}"),
        }
        assert_eq!(state.store.snapshot("w1").await.unwrap().member_count, 1);

        // Last member disconnecting evicts the workspace.
        disconnect_cleanup(&state, alice.connection_id).await;
        assert!(!state.store.contains("w1").await);
    }
}
