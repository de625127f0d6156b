// Core domain types shared between the server and its clients.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workspace role, ordered from most to least privileged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Collaborator,
    Viewer,
}

impl Role {
    /// Returns true when this role grants at least the privileges of `required`.
    pub fn allows(self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Admin => 2,
            Self::Collaborator => 1,
            Self::Viewer => 0,
        }
    }
}

/// Fine-grained permissions attached to an authenticated identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Comment,
    Analyze,
    ManageMembers,
}

impl Role {
    /// The default permission set granted with each role.
    pub fn default_permissions(self) -> Vec<Permission> {
        match self {
            Self::Owner | Self::Admin => vec![
                Permission::Read,
                Permission::Write,
                Permission::Comment,
                Permission::Analyze,
                Permission::ManageMembers,
            ],
            Self::Collaborator => vec![
                Permission::Read,
                Permission::Write,
                Permission::Comment,
                Permission::Analyze,
            ],
            Self::Viewer => vec![Permission::Read, Permission::Comment],
        }
    }
}

/// A verified identity bound to a connection after authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
}

impl Identity {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Per-workspace settings supplied at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceSettings {
    /// Maximum concurrently active sessions.
    #[serde(default = "default_max_members")]
    pub max_members: usize,
    /// Interval hint for client-side auto-save, in seconds.
    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: u64,
    /// Private workspaces admit only the creator and existing members.
    #[serde(default)]
    pub private: bool,
}

fn default_max_members() -> usize {
    10
}

fn default_auto_save_interval_secs() -> u64 {
    30
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            max_members: default_max_members(),
            auto_save_interval_secs: default_auto_save_interval_secs(),
            private: false,
        }
    }
}

/// User-facing presence info for one workspace member.
///
/// This is the only member view that crosses the wire; raw connection
/// handles never leave the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberPresence {
    pub user_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Metadata view of a shared file (content travels in edit frames).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub version: u64,
    pub size_bytes: usize,
    pub modified_at: DateTime<Utc>,
    pub modified_by: String,
}

/// Aggregate activity counters for a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceStats {
    pub edit_count: u64,
    pub comment_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Sanitized snapshot of a workspace, returned on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub settings: WorkspaceSettings,
    pub members: Vec<MemberPresence>,
    pub member_count: usize,
    pub files: Vec<FileInfo>,
    pub stats: WorkspaceStats,
}

/// A cursor location within a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
    /// `None` when the selection is collapsed to the caret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// The kind of write applied to a file. Content is always last-writer-wins;
/// the operation kind is recorded for history and client display.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    #[default]
    Replace,
    Insert,
    Delete,
}

/// Whether an analysis request should run now or be debounced.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Immediate,
    Auto,
}

/// A named analysis capability the engine can be asked for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Lint,
    Security,
    Complexity,
    Style,
}

impl Capability {
    pub const ALL: [Capability; 4] =
        [Capability::Lint, Capability::Security, Capability::Complexity, Capability::Style];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lint => "lint",
            Self::Security => "security",
            Self::Complexity => "complexity",
            Self::Style => "style",
        }
    }
}

/// Severity of a single reported issue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One finding within an analysis report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub line: u32,
    pub severity: Severity,
    pub capability: Capability,
    pub message: String,
}

/// Full structured result of one analysis run, delivered to the originator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisReport {
    /// Overall score in `0..=100`, higher is better.
    pub score: u32,
    pub issues: Vec<Issue>,
    pub analyzed_lines: u32,
    pub analyzed_bytes: usize,
}

impl AnalysisReport {
    /// Reduce a report to the neutral summary broadcast to the workspace.
    pub fn summary(&self) -> AnalysisSummary {
        let mut warning_count = 0;
        let mut error_count = 0;
        for issue in &self.issues {
            match issue.severity {
                Severity::Warning => warning_count += 1,
                Severity::Error => error_count += 1,
                Severity::Info => {}
            }
        }
        AnalysisSummary {
            score: self.score,
            issue_count: self.issues.len(),
            warning_count,
            error_count,
        }
    }
}

/// Score and counts only, never file content. Broadcast to workspace
/// members other than the job originator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub score: u32,
    pub issue_count: usize,
    pub warning_count: usize,
    pub error_count: usize,
}

/// Comment category.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    #[default]
    Note,
    Suggestion,
    Issue,
}

/// A comment attached to a file and line, optionally threaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: Uuid,
    pub file_path: String,
    pub line: u32,
    pub kind: CommentKind,
    pub author_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub resolved: bool,
    /// Emoji shortcode → count.
    #[serde(default)]
    pub reactions: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
}

/// Descriptor supplied when registering a plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
}
