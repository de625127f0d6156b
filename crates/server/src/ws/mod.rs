// WebSocket endpoint: upgrade, connection limits, and the session router
// state threaded through every handler.

pub mod handler;

use std::sync::Arc;

use atelier_common::protocol::ServerLimits;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::auth::IdentityVerifier;
use crate::broadcast::BroadcastFanout;
use crate::plugin::PluginRegistry;
use crate::registry::{ClientMetadata, ConnectionRegistry};
use crate::scheduler::AnalysisScheduler;
use crate::workspace::WorkspaceStore;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: u32 = 262_144;

/// Everything a session handler needs, injected explicitly so each
/// component can be tested in isolation.
#[derive(Clone)]
pub struct SessionRouterState {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<WorkspaceStore>,
    pub fanout: Arc<BroadcastFanout>,
    pub scheduler: Arc<AnalysisScheduler>,
    pub plugins: Arc<PluginRegistry>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub limits: ServerLimits,
}

pub fn router(state: SessionRouterState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<SessionRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let metadata = ClientMetadata {
        user_agent: header_value(&headers, "user-agent"),
        origin: header_value(&headers, "origin"),
        protocol_version: atelier_common::protocol::PROTOCOL_VERSION.to_string(),
    };

    ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| async move {
        handler::handle_socket(state, socket, metadata).await;
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(ToOwned::to_owned)
}
