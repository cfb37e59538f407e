//! Append-only audit and messaging records.
//!
//! Activities, approvals, and notifications are insert-only in normal
//! operation; nothing outside administrative cleanup updates or deletes
//! them. Audits depend on that.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::{ParseEnumError, TaskState};

/// Maximum notification snippet length in characters.
pub const MAX_SNIPPET_LEN: usize = 200;

/// Maximum number of ids in one `markRead` batch.
pub const MAX_MARK_READ_IDS: usize = 100;

/// Kind of audit activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityAction {
    /// Task creation.
    #[serde(rename = "create")]
    Create,
    /// State transition.
    #[serde(rename = "transition")]
    Transition,
    /// Assignment change.
    #[serde(rename = "assign")]
    Assign,
    /// Gate approval recorded.
    #[serde(rename = "approve")]
    Approve,
    /// Scope coerced from PRODUCT to COMPANY by the engine.
    #[serde(rename = "coerce_scope")]
    CoerceScope,
    /// Review summary supplied on `DOING -> REVIEW`.
    #[serde(rename = "execution_summary")]
    ExecutionSummary,
    /// Founder override issued.
    #[serde(rename = "override")]
    Override,
    /// Comment appended.
    #[serde(rename = "COMMENT_ADDED")]
    CommentAdded,
    /// DoD checklist rewritten.
    #[serde(rename = "DOD_UPDATED")]
    DodUpdated,
    /// One evidence entry appended.
    #[serde(rename = "EVIDENCE_ADDED")]
    EvidenceAdded,
    /// Bulk evidence appended.
    #[serde(rename = "EVIDENCE_BULK_ADDED")]
    EvidenceBulkAdded,
    /// `docsUpdated` flag set.
    #[serde(rename = "DOCS_UPDATED_SET")]
    DocsUpdatedSet,
}

impl ActivityAction {
    /// Returns the wire string for this value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Transition => "transition",
            Self::Assign => "assign",
            Self::Approve => "approve",
            Self::CoerceScope => "coerce_scope",
            Self::ExecutionSummary => "execution_summary",
            Self::Override => "override",
            Self::CommentAdded => "COMMENT_ADDED",
            Self::DodUpdated => "DOD_UPDATED",
            Self::EvidenceAdded => "EVIDENCE_ADDED",
            Self::EvidenceBulkAdded => "EVIDENCE_BULK_ADDED",
            Self::DocsUpdatedSet => "DOCS_UPDATED_SET",
        }
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "transition" => Ok(Self::Transition),
            "assign" => Ok(Self::Assign),
            "approve" => Ok(Self::Approve),
            "coerce_scope" => Ok(Self::CoerceScope),
            "execution_summary" => Ok(Self::ExecutionSummary),
            "override" => Ok(Self::Override),
            "COMMENT_ADDED" => Ok(Self::CommentAdded),
            "DOD_UPDATED" => Ok(Self::DodUpdated),
            "EVIDENCE_ADDED" => Ok(Self::EvidenceAdded),
            "EVIDENCE_BULK_ADDED" => Ok(Self::EvidenceBulkAdded),
            "DOCS_UPDATED_SET" => Ok(Self::DocsUpdatedSet),
            other => Err(ParseEnumError {
                kind: "activity action",
                value: other.to_string(),
            }),
        }
    }
}

/// One audit log entry. Ordered per task by row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Row id.
    pub id: i64,
    /// Task the entry belongs to.
    pub task_id: String,
    /// What happened.
    pub action: ActivityAction,
    /// Source state for transitions.
    pub from_state: Option<TaskState>,
    /// Target state for transitions.
    pub to_state: Option<TaskState>,
    /// Who did it (group name, `cockpit`, or `system`).
    pub actor: String,
    /// Free-form detail.
    pub reason: Option<String>,
    /// When it happened.
    pub created_at: String,
}

/// One recorded gate approval. Unique per `(task_id, gate_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Task being approved.
    pub task_id: String,
    /// Gate the approval satisfies.
    pub gate_type: String,
    /// Approving group.
    pub approved_by: String,
    /// Optional reviewer notes.
    pub notes: Option<String>,
    /// Optional link to the evidence backing the approval.
    pub evidence_link: Option<String>,
    /// When the approval was recorded.
    pub created_at: String,
}

/// One mention notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Row id.
    pub id: i64,
    /// Task the comment belongs to.
    pub task_id: String,
    /// Mentioned group.
    pub target_group: String,
    /// Comment author.
    pub actor: String,
    /// First 200 characters of the sanitized comment.
    pub snippet: String,
    /// Read flag.
    pub read: bool,
    /// When the notification was created.
    pub created_at: String,
}

/// One cockpit chat topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    /// `topic-…` identifier.
    pub id: String,
    /// Owning group.
    pub group_folder: String,
    /// Topic title.
    pub title: String,
    /// `active` or `archived`.
    pub status: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Timestamp of the latest message.
    pub last_activity: String,
}

/// One cockpit chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Row id.
    pub id: i64,
    /// Topic binding, when the message belongs to one.
    pub topic_id: Option<String>,
    /// Owning group.
    pub group_folder: String,
    /// Message author.
    pub sender: String,
    /// Message body.
    pub text: String,
    /// When the message was sent.
    pub timestamp: String,
}
