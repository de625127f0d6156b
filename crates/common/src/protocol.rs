// Message types for the atelier-collab.v1 WebSocket protocol.
//
// Every frame is a JSON object tagged by `type` ("namespace:action"). A
// request that expects a reply carries a client-chosen correlation `id`; the
// reply echoes it. Broadcasts and other unsolicited frames omit `id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    AnalysisReport, AnalysisSummary, Capability, Comment, CommentKind, CursorPosition,
    EditOperation, MemberPresence, Permission, PluginDescriptor, Role, TriggerMode,
    WorkspaceSettings, WorkspaceSnapshot,
};

/// Protocol version advertised in `connection:established`.
pub const PROTOCOL_VERSION: &str = "atelier-collab.v1";

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Bind an externally-issued credential to this connection.
    #[serde(rename = "auth:authenticate")]
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        credential: String,
    },

    /// Join (creating on first use) a workspace.
    #[serde(rename = "workspace:join")]
    WorkspaceJoin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace_id: String,
        /// Display name, used only when the workspace is created by this join.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Settings, used only when the workspace is created by this join.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<WorkspaceSettings>,
    },

    /// Leave the currently joined workspace.
    #[serde(rename = "workspace:leave")]
    WorkspaceLeave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace_id: String,
    },

    /// Request an analysis run, immediately or debounced.
    #[serde(rename = "analysis:realtime")]
    AnalysisRealtime {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Workspace scope for the summary broadcast; `None` for a private run.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<String>,
        file_path: String,
        content: String,
        #[serde(default)]
        capabilities: Vec<Capability>,
        #[serde(default)]
        mode: TriggerMode,
    },

    /// Move the caller's cursor. No direct reply; broadcast to the workspace.
    #[serde(rename = "collaboration:cursor")]
    CollaborationCursor {
        file_path: String,
        cursor: CursorPosition,
    },

    /// Write file content (last-writer-wins). Broadcast to the workspace;
    /// `mode: auto` additionally arms the debounced analysis trigger.
    #[serde(rename = "collaboration:edit")]
    CollaborationEdit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        file_path: String,
        content: String,
        #[serde(default)]
        operation: EditOperation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<TriggerMode>,
    },

    /// Add a comment to a file/line, optionally as a threaded reply.
    #[serde(rename = "collaboration:comment")]
    CollaborationComment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        file_path: String,
        line: u32,
        #[serde(default)]
        kind: CommentKind,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
    },

    /// Toggle a comment's resolved flag.
    #[serde(rename = "collaboration:comment_resolve")]
    CollaborationCommentResolve {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        comment_id: Uuid,
        resolved: bool,
    },

    /// React to a comment with an emoji shortcode.
    #[serde(rename = "collaboration:comment_react")]
    CollaborationCommentReact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        comment_id: Uuid,
        emoji: String,
    },

    /// Register a plugin descriptor for this connection.
    #[serde(rename = "plugin:register")]
    PluginRegister {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        plugin_id: String,
        descriptor: PluginDescriptor,
    },

    /// Execute a plugin action.
    #[serde(rename = "plugin:execute")]
    PluginExecute {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        plugin_id: String,
        action: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once, immediately after connect. Advertises capabilities and limits.
    #[serde(rename = "connection:established")]
    ConnectionEstablished {
        connection_id: Uuid,
        protocol_version: String,
        /// Message types this server accepts.
        supported_messages: Vec<String>,
        limits: ServerLimits,
    },

    #[serde(rename = "auth:success")]
    AuthSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        user_id: String,
        role: Role,
        permissions: Vec<Permission>,
    },

    #[serde(rename = "workspace:joined")]
    WorkspaceJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace: WorkspaceSnapshot,
    },

    #[serde(rename = "workspace:left")]
    WorkspaceLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace_id: String,
    },

    /// Broadcast: a member joined the workspace.
    #[serde(rename = "workspace:member_joined")]
    MemberJoined {
        workspace_id: String,
        member: MemberPresence,
    },

    /// Broadcast: a member left the workspace deliberately.
    #[serde(rename = "workspace:member_left")]
    MemberLeft {
        workspace_id: String,
        user_id: String,
    },

    /// Broadcast: a member's connection dropped.
    #[serde(rename = "workspace:member_disconnected")]
    MemberDisconnected {
        workspace_id: String,
        user_id: String,
    },

    #[serde(rename = "analysis:queued")]
    AnalysisQueued {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        job_id: Uuid,
        file_path: String,
    },

    #[serde(rename = "analysis:started")]
    AnalysisStarted {
        job_id: Uuid,
        file_path: String,
    },

    #[serde(rename = "analysis:completed")]
    AnalysisCompleted {
        job_id: Uuid,
        file_path: String,
        report: AnalysisReport,
    },

    #[serde(rename = "analysis:failed")]
    AnalysisFailed {
        job_id: Uuid,
        file_path: String,
        code: String,
        message: String,
    },

    /// Broadcast: score/counts summary of a workspace-scoped analysis run.
    #[serde(rename = "workspace:analysis_completed")]
    WorkspaceAnalysisCompleted {
        workspace_id: String,
        file_path: String,
        summary: AnalysisSummary,
    },

    /// Broadcast: a workspace-scoped analysis run failed. Deliberately
    /// neutral; error detail goes only to the job's originator.
    #[serde(rename = "workspace:analysis_failed")]
    WorkspaceAnalysisFailed {
        workspace_id: String,
        file_path: String,
    },

    /// Broadcast: a member moved their cursor.
    #[serde(rename = "collaboration:cursor_update")]
    CursorUpdate {
        workspace_id: String,
        user_id: String,
        file_path: String,
        cursor: CursorPosition,
    },

    /// Broadcast: an accepted write, carrying the resulting version.
    /// The author is excluded from the fanout and gets no echo.
    #[serde(rename = "collaboration:edit")]
    EditApplied {
        workspace_id: String,
        user_id: String,
        file_path: String,
        content: String,
        version: u64,
        operation: EditOperation,
    },

    /// Reply to the author and broadcast to the workspace.
    #[serde(rename = "collaboration:comment_added")]
    CommentAdded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace_id: String,
        comment: Comment,
    },

    #[serde(rename = "collaboration:comment_resolved")]
    CommentResolved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace_id: String,
        comment_id: Uuid,
        resolved: bool,
        resolved_by: String,
    },

    #[serde(rename = "collaboration:comment_reaction")]
    CommentReaction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        workspace_id: String,
        comment_id: Uuid,
        emoji: String,
        count: u32,
    },

    #[serde(rename = "plugin:registered")]
    PluginRegistered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        plugin_id: String,
    },

    #[serde(rename = "plugin:result")]
    PluginResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        plugin_id: String,
        action: String,
        result: serde_json::Value,
    },

    /// Typed error correlated to the originating request when possible.
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

/// Server-side limits advertised on connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerLimits {
    pub max_frame_bytes: u32,
    pub debounce_window_ms: u64,
    pub max_running_jobs: usize,
    pub max_history_entries: usize,
}

/// Message type strings accepted by the server, advertised on connect.
pub const SUPPORTED_CLIENT_MESSAGES: &[&str] = &[
    "auth:authenticate",
    "workspace:join",
    "workspace:leave",
    "analysis:realtime",
    "collaboration:cursor",
    "collaboration:edit",
    "collaboration:comment",
    "collaboration:comment_resolve",
    "collaboration:comment_react",
    "plugin:register",
    "plugin:execute",
];

/// The `type` and `id` of a frame, recovered even when the typed decode
/// fails, so error replies can reference the original request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: Option<String>,
    pub id: Option<String>,
}

/// Extract the envelope header from a raw frame without a typed decode.
/// Returns an empty header when the frame is not a JSON object.
pub fn frame_header(raw: &str) -> FrameHeader {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return FrameHeader::default();
    };
    FrameHeader {
        kind: value.get("type").and_then(|v| v.as_str()).map(ToOwned::to_owned),
        id: value.get("id").and_then(|v| v.as_str()).map(ToOwned::to_owned),
    }
}

pub fn decode_client_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
