//! Task domain model: workflow states, task records, and typed metadata.
//!
//! The metadata blob is modeled as a struct with named optional fields for
//! every recognized key plus a flattened passthrough map, so unknown keys
//! survive a read-modify-write cycle byte-for-byte (modulo key ordering).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::POLICY_VERSION;

/// Maximum accepted title length in characters.
pub const MAX_TITLE_LEN: usize = 140;

/// Maximum serialized metadata size in bytes.
pub const MAX_METADATA_BYTES: usize = 8192;

/// Maximum number of Definition-of-Done checklist items.
pub const MAX_DOD_ITEMS: usize = 50;

/// Minimum DoD item text length after trimming.
pub const DOD_TEXT_MIN: usize = 4;

/// Maximum DoD item text length after trimming.
pub const DOD_TEXT_MAX: usize = 200;

/// Maximum evidence link length in characters.
pub const MAX_EVIDENCE_LINK_LEN: usize = 2000;

/// Maximum evidence note length in characters.
pub const MAX_EVIDENCE_NOTE_LEN: usize = 1000;

/// Maximum number of links in one bulk evidence append.
pub const MAX_BULK_EVIDENCE_LINKS: usize = 20;

/// Error raised when a workflow enum fails to parse from its wire string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {kind}: {value}")]
pub struct ParseEnumError {
    /// Which enum rejected the value.
    pub kind: &'static str,
    /// The rejected value.
    pub value: String,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[doc = $text]
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Returns the wire string for this value.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum!(
    /// Workflow state of a task. `Killed` is reserved: the graph defines no
    /// edges into or out of it.
    TaskState,
    "state",
    {
        Inbox => "INBOX",
        Triaged => "TRIAGED",
        Ready => "READY",
        Doing => "DOING",
        Review => "REVIEW",
        Approval => "APPROVAL",
        Done => "DONE",
        Blocked => "BLOCKED",
        Killed => "KILLED",
    }
);

wire_enum!(
    /// Category of work a task represents.
    TaskType,
    "task_type",
    {
        Feature => "FEATURE",
        Bug => "BUG",
        Epic => "EPIC",
        Security => "SECURITY",
        RevOps => "REVOPS",
        Ops => "OPS",
        Research => "RESEARCH",
        Content => "CONTENT",
        Doc => "DOC",
        Incident => "INCIDENT",
    }
);

wire_enum!(
    /// Task priority. Defaults to `P2`.
    Priority,
    "priority",
    {
        P0 => "P0",
        P1 => "P1",
        P2 => "P2",
        P3 => "P3",
    }
);

wire_enum!(
    /// Whether a task belongs to the company as a whole or one product.
    Scope,
    "scope",
    {
        Company => "COMPANY",
        Product => "PRODUCT",
    }
);

wire_enum!(
    /// Named review requirement a task must clear before `DONE`.
    Gate,
    "gate",
    {
        None => "None",
        Security => "Security",
        RevOps => "RevOps",
        Claims => "Claims",
        Product => "Product",
    }
);

impl Default for Priority {
    fn default() -> Self {
        Self::P2
    }
}

impl Default for TaskType {
    fn default() -> Self {
        Self::Feature
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::None
    }
}

/// One Definition-of-Done checklist item with a stable identity.
///
/// The `id` survives renames and reorders so cockpit drag-and-drop does
/// not reset completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DodItem {
    /// Stable identifier matching `^dod-[a-z0-9]+$`.
    pub id: String,
    /// Item text, 4..=200 characters after trimming.
    pub text: String,
    /// Completion flag.
    pub done: bool,
}

/// One appended evidence entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// Evidence URL.
    pub link: String,
    /// Optional free-form note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When the entry was appended (UTC ISO-8601).
    #[serde(rename = "addedAt")]
    pub added_at: String,
}

/// Founder-issued gate exemption recorded on the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    /// Actor that issued the override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    /// Why the gate is being bypassed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The risk explicitly accepted.
    #[serde(rename = "acceptedRisk", skip_serializing_if = "Option::is_none")]
    pub accepted_risk: Option<String>,
    /// Deadline for the retroactive review (UTC ISO-8601).
    #[serde(rename = "reviewDeadlineIso", skip_serializing_if = "Option::is_none")]
    pub review_deadline_iso: Option<String>,
}

impl OverrideRecord {
    /// Returns the names of required fields that are missing or blank.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        if blank(&self.by) {
            missing.push("by");
        }
        if blank(&self.reason) {
            missing.push("reason");
        }
        if blank(&self.accepted_risk) {
            missing.push("acceptedRisk");
        }
        if blank(&self.review_deadline_iso) {
            missing.push("reviewDeadlineIso");
        }
        missing
    }

    /// Returns true when every required field is populated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// Typed task metadata.
///
/// Recognized keys get named fields; everything else flows through `extra`
/// untouched so round-trips never drop data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Policy kernel version stamped at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,

    /// Named owner used by strict-mode checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Text-only mirror of the DoD checklist.
    #[serde(rename = "dodChecklist", skip_serializing_if = "Option::is_none")]
    pub dod_checklist: Option<Vec<String>>,

    /// DoD items with stable identity and completion state.
    #[serde(rename = "dodStatus", skip_serializing_if = "Option::is_none")]
    pub dod_status: Option<Vec<DodItem>>,

    /// Append-only evidence log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<EvidenceEntry>>,

    /// Whether the documentation followup has been completed.
    #[serde(rename = "docsUpdated", skip_serializing_if = "Option::is_none")]
    pub docs_updated: Option<bool>,

    /// Whether leaving review requires recorded evidence.
    #[serde(rename = "evidenceRequired", skip_serializing_if = "Option::is_none")]
    pub evidence_required: Option<bool>,

    /// Link to the audit artifact satisfying the evidence requirement.
    #[serde(rename = "auditLink", skip_serializing_if = "Option::is_none")]
    pub audit_link: Option<String>,

    /// Founder override of the task's gate, when issued.
    #[serde(rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_record: Option<OverrideRecord>,

    /// Unrecognized keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Error raised when metadata fails its size bound or fails to parse.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The serialized blob exceeds [`MAX_METADATA_BYTES`].
    #[error("metadata exceeds {MAX_METADATA_BYTES} bytes (got {got})")]
    TooLarge {
        /// Serialized size in bytes.
        got: usize,
    },

    /// The stored blob is not valid JSON for the metadata shape.
    #[error("metadata parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl TaskMetadata {
    /// Serializes to the canonical storage string, enforcing the size bound.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::TooLarge`] when the serialized form exceeds
    /// [`MAX_METADATA_BYTES`].
    pub fn to_storage(&self) -> Result<String, MetadataError> {
        let raw = serde_json::to_string(self)?;
        if raw.len() > MAX_METADATA_BYTES {
            return Err(MetadataError::TooLarge { got: raw.len() });
        }
        Ok(raw)
    }

    /// Parses the stored blob; `None` or empty yields the default.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Parse`] when the blob is not valid JSON.
    pub fn from_storage(raw: Option<&str>) -> Result<Self, MetadataError> {
        match raw {
            None | Some("") => Ok(Self::default()),
            Some(s) => Ok(serde_json::from_str(s)?),
        }
    }

    /// Stamps the current policy kernel version.
    pub fn stamp_policy_version(&mut self) {
        self.policy_version = Some(POLICY_VERSION.to_string());
    }
}

/// A governed work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// `gov-…` identifier.
    pub id: String,
    /// Short summary, 1..=140 characters.
    pub title: String,
    /// Optional long-form description.
    pub description: Option<String>,
    /// Category of work.
    pub task_type: TaskType,
    /// Workflow state.
    pub state: TaskState,
    /// Priority, default `P2`.
    pub priority: Priority,
    /// Company-wide or product-bound.
    pub scope: Scope,
    /// Product binding; always `None` for COMPANY scope.
    pub product_id: Option<String>,
    /// Group the task is assigned to.
    pub assigned_group: String,
    /// Specific agent identity executing the task, when dispatched.
    pub executor: Option<String>,
    /// Group that originated the task.
    pub created_by: String,
    /// Review gate required before `DONE`.
    pub gate: Gate,
    /// Whether a DoD checklist is mandatory for this task.
    pub dod_required: bool,
    /// Typed metadata blob.
    pub metadata: TaskMetadata,
    /// Optimistic-concurrency version, starts at 1.
    pub version: i64,
    /// Creation timestamp (UTC ISO-8601 millis).
    pub created_at: String,
    /// Last mutation timestamp (UTC ISO-8601 millis).
    pub updated_at: String,
}

/// Per-type template defaults applied at creation for absent fields.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    /// Default gate.
    pub gate: Gate,
    /// Default assigned group.
    pub assigned_group: &'static str,
    /// Default DoD checklist texts.
    pub dod_checklist: &'static [&'static str],
}

impl TaskType {
    /// Returns the creation template for this task type.
    #[must_use]
    pub const fn template(self) -> TaskTemplate {
        match self {
            Self::Feature => TaskTemplate {
                gate: Gate::None,
                assigned_group: "developer",
                dod_checklist: &["Implementation complete", "Tests added", "Docs updated"],
            },
            Self::Bug => TaskTemplate {
                gate: Gate::None,
                assigned_group: "developer",
                dod_checklist: &[
                    "Root cause identified",
                    "Fix implemented",
                    "Regression test added",
                ],
            },
            Self::Security => TaskTemplate {
                gate: Gate::Security,
                assigned_group: "security",
                dod_checklist: &[
                    "Threat assessed",
                    "Mitigation implemented",
                    "Docs updated",
                ],
            },
            Self::RevOps => TaskTemplate {
                gate: Gate::RevOps,
                assigned_group: "revops",
                dod_checklist: &["Revenue impact reviewed", "Change applied"],
            },
            Self::Content => TaskTemplate {
                gate: Gate::Claims,
                assigned_group: "product",
                dod_checklist: &["Draft written", "Claims reviewed"],
            },
            Self::Doc => TaskTemplate {
                gate: Gate::None,
                assigned_group: "developer",
                dod_checklist: &["Docs written"],
            },
            Self::Epic | Self::Ops | Self::Research | Self::Incident => TaskTemplate {
                gate: Gate::None,
                assigned_group: "main",
                dod_checklist: &[],
            },
        }
    }
}
