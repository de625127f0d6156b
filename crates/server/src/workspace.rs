// In-memory workspace store.
//
// Each workspace lives behind its own mutex; the outer map is only an
// addressing layer. Operations on workspace A never block operations on
// workspace B. Join and leave take the outer write lock so that evicting a
// workspace on its last leave is atomic with the leave itself.
//
// Conflict policy for file writes is last-writer-wins by arrival order at
// the workspace lock. The version counter increments under that lock, so
// versions are strictly increasing even across conflicting writes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use atelier_common::types::{
    Comment, CommentKind, CursorPosition, EditOperation, FileInfo, Identity, MemberPresence,
    Permission, Role, WorkspaceSettings, WorkspaceSnapshot, WorkspaceStats,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("workspace not found")]
    WorkspaceNotFound,
    #[error("workspace is at its member limit")]
    WorkspaceFull,
    #[error("caller lacks the required permission")]
    NotAuthorized,
    #[error("connection is not an active member of this workspace")]
    NotAMember,
    #[error("comment not found")]
    CommentNotFound,
}

/// Membership record for one user. Survives individual connections so a
/// user who reconnects keeps their role and joined-at timestamp for as long
/// as the workspace itself lives.
#[derive(Debug, Clone)]
struct MemberRecord {
    user_id: String,
    role: Role,
    permissions: Vec<Permission>,
    joined_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

impl MemberRecord {
    fn presence(&self) -> MemberPresence {
        MemberPresence {
            user_id: self.user_id.clone(),
            role: self.role,
            joined_at: self.joined_at,
            last_active_at: self.last_active_at,
        }
    }
}

#[derive(Debug, Clone)]
struct FileState {
    content: String,
    version: u64,
    modified_at: DateTime<Utc>,
    modified_by: String,
}

/// One entry in the bounded change-history log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub at: DateTime<Utc>,
    pub user_id: String,
    pub file_path: String,
    pub operation: EditOperation,
    pub version: u64,
}

#[derive(Debug)]
struct WorkspaceState {
    id: String,
    name: String,
    creator_id: String,
    created_at: DateTime<Utc>,
    settings: WorkspaceSettings,
    members: HashMap<String, MemberRecord>,
    /// Active sessions: connection id → user id.
    sessions: HashMap<Uuid, String>,
    files: HashMap<String, FileState>,
    /// Ephemeral cursors, keyed by (connection, file path).
    cursors: HashMap<(Uuid, String), CursorPosition>,
    comments: Vec<Comment>,
    history: VecDeque<ChangeEntry>,
    stats: WorkspaceStats,
}

impl WorkspaceState {
    fn user_for(&self, connection_id: Uuid) -> Result<String, StoreError> {
        self.sessions.get(&connection_id).cloned().ok_or(StoreError::NotAMember)
    }

    fn require_permission(
        &mut self,
        connection_id: Uuid,
        permission: Permission,
    ) -> Result<String, StoreError> {
        let user_id = self.user_for(connection_id)?;
        let member = self.members.get_mut(&user_id).ok_or(StoreError::NotAMember)?;
        if !member.permissions.contains(&permission) {
            return Err(StoreError::NotAuthorized);
        }
        member.last_active_at = Utc::now();
        Ok(user_id)
    }

    fn active_user_count(&self) -> usize {
        let mut users: Vec<&String> = self.sessions.values().collect();
        users.sort();
        users.dedup();
        users.len()
    }

    fn snapshot(&self) -> WorkspaceSnapshot {
        let mut members: Vec<MemberPresence> = self
            .members
            .values()
            .filter(|member| self.sessions.values().any(|user| user == &member.user_id))
            .map(MemberRecord::presence)
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let mut files: Vec<FileInfo> = self
            .files
            .iter()
            .map(|(path, file)| FileInfo {
                path: path.clone(),
                version: file.version,
                size_bytes: file.content.len(),
                modified_at: file.modified_at,
                modified_by: file.modified_by.clone(),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        WorkspaceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            creator_id: self.creator_id.clone(),
            created_at: self.created_at,
            settings: self.settings.clone(),
            member_count: members.len(),
            members,
            files,
            stats: self.stats.clone(),
        }
    }
}

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    pub snapshot: WorkspaceSnapshot,
    pub member: MemberPresence,
    pub created: bool,
}

/// Result of a leave (deliberate or disconnect-driven).
#[derive(Debug)]
pub struct LeaveOutcome {
    pub user_id: String,
    /// True when this was the last active session and the workspace was
    /// removed from the store.
    pub evicted: bool,
}

/// Parameters for appending a comment.
#[derive(Debug, Clone)]
pub struct NewComment {
    pub file_path: String,
    pub line: u32,
    pub kind: CommentKind,
    pub body: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug)]
pub struct WorkspaceStore {
    workspaces: RwLock<HashMap<String, Arc<Mutex<WorkspaceState>>>>,
    history_cap: usize,
}

impl WorkspaceStore {
    pub fn new(history_cap: usize) -> Arc<Self> {
        Arc::new(Self { workspaces: RwLock::new(HashMap::new()), history_cap })
    }

    /// Ensure a workspace exists, with the caller as creator when it is new.
    ///
    /// Idempotent: an existing workspace is returned unchanged and the
    /// supplied name and settings are ignored. A workspace created here but
    /// never joined lives until its first member cycle ends.
    pub async fn create_or_get(
        &self,
        workspace_id: &str,
        creator: &Identity,
        name: Option<String>,
        settings: Option<WorkspaceSettings>,
    ) -> WorkspaceSnapshot {
        let mut outer = self.workspaces.write().await;
        let (entry, _) = Self::ensure_entry(&mut outer, workspace_id, creator, name, settings);
        let state = entry.lock().await;
        state.snapshot()
    }

    fn ensure_entry(
        outer: &mut HashMap<String, Arc<Mutex<WorkspaceState>>>,
        workspace_id: &str,
        creator: &Identity,
        name: Option<String>,
        settings: Option<WorkspaceSettings>,
    ) -> (Arc<Mutex<WorkspaceState>>, bool) {
        match outer.get(workspace_id) {
            Some(entry) => (Arc::clone(entry), false),
            None => {
                let state = WorkspaceState {
                    id: workspace_id.to_string(),
                    name: name.unwrap_or_else(|| workspace_id.to_string()),
                    creator_id: creator.user_id.clone(),
                    created_at: Utc::now(),
                    settings: settings.unwrap_or_default(),
                    members: HashMap::new(),
                    sessions: HashMap::new(),
                    files: HashMap::new(),
                    cursors: HashMap::new(),
                    comments: Vec::new(),
                    history: VecDeque::new(),
                    stats: WorkspaceStats::default(),
                };
                let entry = Arc::new(Mutex::new(state));
                outer.insert(workspace_id.to_string(), Arc::clone(&entry));
                (entry, true)
            }
        }
    }

    /// Join a workspace, creating it on first use with the caller as owner.
    ///
    /// Idempotent on the workspace itself: when it already exists the
    /// supplied name and settings are ignored.
    pub async fn join(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
        identity: &Identity,
        name: Option<String>,
        settings: Option<WorkspaceSettings>,
    ) -> Result<JoinOutcome, StoreError> {
        let mut outer = self.workspaces.write().await;
        let now = Utc::now();

        let (entry, created) =
            Self::ensure_entry(&mut outer, workspace_id, identity, name, settings);

        let mut state = entry.lock().await;

        let is_creator = state.creator_id == identity.user_id;
        if state.settings.private && !is_creator && !state.members.contains_key(&identity.user_id) {
            // Roll back a creation that cannot be joined; cannot happen for
            // the creator, but keeps the map clean if it ever does.
            if created {
                outer.remove(workspace_id);
            }
            return Err(StoreError::NotAuthorized);
        }

        if state.active_user_count() >= state.settings.max_members
            && !state.sessions.values().any(|user| user == &identity.user_id)
        {
            return Err(StoreError::WorkspaceFull);
        }

        let member = state
            .members
            .entry(identity.user_id.clone())
            .or_insert_with(|| MemberRecord {
                user_id: identity.user_id.clone(),
                role: if is_creator { Role::Owner } else { identity.role },
                permissions: if is_creator {
                    Role::Owner.default_permissions()
                } else {
                    identity.permissions.clone()
                },
                joined_at: now,
                last_active_at: now,
            });
        member.last_active_at = now;
        let presence = member.presence();

        state.sessions.insert(connection_id, identity.user_id.clone());
        state.stats.last_activity_at = Some(now);

        Ok(JoinOutcome { snapshot: state.snapshot(), member: presence, created })
    }

    /// Remove the connection's active session. Evicts the workspace when the
    /// last session leaves; eviction and leave are a single atomic step
    /// under the outer write lock.
    pub async fn leave(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
    ) -> Result<LeaveOutcome, StoreError> {
        let mut outer = self.workspaces.write().await;
        let entry = outer.get(workspace_id).cloned().ok_or(StoreError::WorkspaceNotFound)?;

        let mut state = entry.lock().await;
        let user_id = state.sessions.remove(&connection_id).ok_or(StoreError::NotAMember)?;
        state.cursors.retain(|(cursor_connection, _), _| *cursor_connection != connection_id);
        state.stats.last_activity_at = Some(Utc::now());

        let evicted = state.sessions.is_empty();
        if evicted {
            outer.remove(workspace_id);
        }

        Ok(LeaveOutcome { user_id, evicted })
    }

    /// Apply a file write. Last-writer-wins: whatever content arrives at the
    /// workspace lock latest fully determines the file. Returns the file's
    /// new metadata, version already incremented.
    pub async fn update_file(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
        file_path: &str,
        new_content: String,
        operation: EditOperation,
    ) -> Result<FileInfo, StoreError> {
        let entry = self.entry(workspace_id).await?;
        let mut state = entry.lock().await;

        let user_id = state.require_permission(connection_id, Permission::Write)?;
        let now = Utc::now();

        let version = {
            let file = state.files.entry(file_path.to_string()).or_insert_with(|| FileState {
                content: String::new(),
                version: 0,
                modified_at: now,
                modified_by: user_id.clone(),
            });
            file.version += 1;
            file.content = new_content;
            file.modified_at = now;
            file.modified_by = user_id.clone();
            file.version
        };

        let change = ChangeEntry {
            at: now,
            user_id: user_id.clone(),
            file_path: file_path.to_string(),
            operation,
            version,
        };
        while state.history.len() >= self.history_cap.max(1) {
            state.history.pop_front();
        }
        state.history.push_back(change);

        state.stats.edit_count += 1;
        state.stats.last_activity_at = Some(now);

        let file = &state.files[file_path];
        Ok(FileInfo {
            path: file_path.to_string(),
            version: file.version,
            size_bytes: file.content.len(),
            modified_at: file.modified_at,
            modified_by: file.modified_by.clone(),
        })
    }

    /// Overwrite the caller's cursor for one file. Returns the user id for
    /// the presence broadcast.
    pub async fn update_cursor(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
        file_path: &str,
        cursor: CursorPosition,
    ) -> Result<String, StoreError> {
        let entry = self.entry(workspace_id).await?;
        let mut state = entry.lock().await;
        let user_id = state.require_permission(connection_id, Permission::Read)?;
        state.cursors.insert((connection_id, file_path.to_string()), cursor);
        Ok(user_id)
    }

    /// Append a comment. Never mutates file content.
    pub async fn append_comment(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
        new_comment: NewComment,
    ) -> Result<Comment, StoreError> {
        let entry = self.entry(workspace_id).await?;
        let mut state = entry.lock().await;

        let user_id = state.require_permission(connection_id, Permission::Comment)?;
        if let Some(parent_id) = new_comment.parent_id {
            if !state.comments.iter().any(|comment| comment.id == parent_id) {
                return Err(StoreError::CommentNotFound);
            }
        }

        let comment = Comment {
            id: Uuid::new_v4(),
            file_path: new_comment.file_path,
            line: new_comment.line,
            kind: new_comment.kind,
            author_id: user_id,
            body: new_comment.body,
            parent_id: new_comment.parent_id,
            resolved: false,
            reactions: Default::default(),
            created_at: Utc::now(),
        };
        state.comments.push(comment.clone());
        state.stats.comment_count += 1;
        state.stats.last_activity_at = Some(comment.created_at);

        Ok(comment)
    }

    /// Toggle a comment's resolved flag. Returns the resolving user id.
    pub async fn resolve_comment(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
        comment_id: Uuid,
        resolved: bool,
    ) -> Result<String, StoreError> {
        let entry = self.entry(workspace_id).await?;
        let mut state = entry.lock().await;
        let user_id = state.require_permission(connection_id, Permission::Comment)?;

        let comment = state
            .comments
            .iter_mut()
            .find(|comment| comment.id == comment_id)
            .ok_or(StoreError::CommentNotFound)?;
        comment.resolved = resolved;
        Ok(user_id)
    }

    /// Increment a reaction counter. Returns the new count.
    pub async fn add_reaction(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
        comment_id: Uuid,
        emoji: &str,
    ) -> Result<u32, StoreError> {
        let entry = self.entry(workspace_id).await?;
        let mut state = entry.lock().await;
        state.require_permission(connection_id, Permission::Read)?;

        let comment = state
            .comments
            .iter_mut()
            .find(|comment| comment.id == comment_id)
            .ok_or(StoreError::CommentNotFound)?;
        let count = comment.reactions.entry(emoji.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    /// Connection ids of all active sessions, for broadcast fanout.
    pub async fn active_sessions(&self, workspace_id: &str) -> Vec<Uuid> {
        match self.entry(workspace_id).await {
            Ok(entry) => entry.lock().await.sessions.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn snapshot(&self, workspace_id: &str) -> Option<WorkspaceSnapshot> {
        let entry = self.entry(workspace_id).await.ok()?;
        let state = entry.lock().await;
        Some(state.snapshot())
    }

    pub async fn contains(&self, workspace_id: &str) -> bool {
        self.workspaces.read().await.contains_key(workspace_id)
    }

    /// True when the connection holds an active session in the workspace.
    pub async fn is_active_member(&self, workspace_id: &str, connection_id: Uuid) -> bool {
        match self.entry(workspace_id).await {
            Ok(entry) => entry.lock().await.sessions.contains_key(&connection_id),
            Err(_) => false,
        }
    }

    /// Change-history snapshot, newest last. Bounded by the history cap.
    pub async fn history(&self, workspace_id: &str) -> Vec<ChangeEntry> {
        match self.entry(workspace_id).await {
            Ok(entry) => entry.lock().await.history.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Cursor states held by one connection, for tests and diagnostics.
    pub async fn cursors_for_connection(
        &self,
        workspace_id: &str,
        connection_id: Uuid,
    ) -> Vec<(String, CursorPosition)> {
        match self.entry(workspace_id).await {
            Ok(entry) => entry
                .lock()
                .await
                .cursors
                .iter()
                .filter(|((cursor_connection, _), _)| *cursor_connection == connection_id)
                .map(|((_, path), cursor)| (path.clone(), *cursor))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn entry(&self, workspace_id: &str) -> Result<Arc<Mutex<WorkspaceState>>, StoreError> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .cloned()
            .ok_or(StoreError::WorkspaceNotFound)
    }
}
