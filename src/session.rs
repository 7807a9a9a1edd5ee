//! Session and conversation data model shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Inferred activity state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionStatus {
    Thinking,
    ExecutingTool { name: String },
    AwaitingApproval,
    Waiting,
    Idle,
    Stopped,
    Unknown,
}

impl SessionStatus {
    /// Short lowercase label, used in logs and filters.
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Thinking => "thinking",
            SessionStatus::ExecutingTool { .. } => "executing_tool",
            SessionStatus::AwaitingApproval => "awaiting_approval",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Idle => "idle",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

/// What kind of record a line held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Message,
    Summary,
    /// The agent is blocked on a permission decision.
    ApprovalRequest,
}

/// One content block within an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    pub content_type: ContentType,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub text: String,
}

/// Token usage reported on a single assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub role: Role,
    /// Type of the entry's last block.
    pub content_type: ContentType,
    pub tool_name: Option<String>,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: EntryKind,
    pub blocks: Vec<ContentBlock>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    /// Injected by the harness rather than typed by the user.
    pub is_meta: bool,
}

impl ConversationEntry {
    /// A plain user prompt (not a tool result, not harness-injected).
    pub fn is_user_prompt(&self) -> bool {
        self.kind == EntryKind::Message
            && self.role == Role::User
            && !self.is_meta
            && self.content_type == ContentType::Text
    }

    /// Entries that take part in status inference.
    pub fn is_classifiable(&self) -> bool {
        !self.is_meta && matches!(self.kind, EntryKind::Message | EntryKind::ApprovalRequest)
    }

    pub fn is_tool_event(&self) -> bool {
        matches!(
            self.content_type,
            ContentType::ToolUse | ContentType::ToolResult
        )
    }
}

/// Full record for one tracked session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub project_name: String,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub log_path: PathBuf,
    pub offset: u64,
    pub status: SessionStatus,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_output_tokens: u64,
    pub context_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub message_count: u64,
    pub first_prompt: Option<String>,
    pub summary: Option<String>,
    pub has_tool_use: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub file_exists: bool,
    pub archived: bool,
    /// Times the log was truncated or replaced since tracking began.
    #[serde(skip)]
    pub rewrites: u64,
}

impl Session {
    /// Empty record for a log that has not been read yet.
    pub fn new(log_path: &Path) -> Self {
        let id = log_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let project_path = crate::metadata::project_path_from_log(log_path);
        Self {
            id,
            project_name: project_name(&project_path),
            project_path,
            cwd: None,
            git_branch: None,
            log_path: log_path.to_path_buf(),
            offset: 0,
            status: SessionStatus::Unknown,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            total_output_tokens: 0,
            context_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            message_count: 0,
            first_prompt: None,
            summary: None,
            has_tool_use: false,
            created_at: None,
            last_modified: None,
            file_exists: true,
            archived: false,
            rewrites: 0,
        }
    }

    /// Equality over everything a consumer can observe; `offset` and
    /// `rewrites` are bookkeeping.
    pub fn same_observable(&self, other: &Session) -> bool {
        let mut a = self.clone();
        a.offset = other.offset;
        a.rewrites = other.rewrites;
        a == *other
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.total_output_tokens)
            .saturating_add(self.cache_creation_tokens)
            .saturating_add(self.cache_read_tokens)
    }

    pub fn summary_view(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            log_path: self.log_path.clone(),
            project_path: self.project_path.clone(),
            project_name: self.project_name.clone(),
            git_branch: self.git_branch.clone(),
            model: self.model.clone(),
            status: self.status.clone(),
            message_count: self.message_count,
            total_tokens: self.total_tokens(),
            context_tokens: self.context_tokens,
            first_prompt: self.first_prompt.clone(),
            summary: self.summary.clone(),
            has_tool_use: self.has_tool_use,
            created_at: self.created_at,
            last_modified: self.last_modified,
            file_exists: self.file_exists,
            archived: self.archived,
        }
    }
}

/// Project name (last component of path).
pub fn project_name(project_path: &str) -> String {
    Path::new(project_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| project_path.to_string())
}

/// Metadata-only row returned by `list_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub log_path: PathBuf,
    pub project_path: String,
    pub project_name: String,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub message_count: u64,
    pub total_tokens: u64,
    pub context_tokens: u64,
    pub first_prompt: Option<String>,
    pub summary: Option<String>,
    pub has_tool_use: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub file_exists: bool,
    pub archived: bool,
}

/// Filter for `list_sessions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionFilter {
    /// Substring of the project path.
    pub project: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub include_archived: bool,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        if session.archived && !self.include_archived {
            return false;
        }
        if let Some(project) = &self.project {
            if !session.project_path.contains(project.as_str()) {
                return false;
            }
        }
        if let Some(branch) = &self.git_branch {
            if session.git_branch.as_deref() != Some(branch.as_str()) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if session.model.as_deref() != Some(model.as_str()) {
                return false;
            }
        }
        true
    }
}
