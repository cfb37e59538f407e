//! Capability model for external provider access.
//!
//! A capability entitles one group to call one provider at a bounded
//! access level, optionally narrowed by allow/deny action lists and an
//! expiry. Checks are fail-closed throughout: deny lists win over allow
//! lists, unknown action verbs are classified at the highest risk level,
//! and expired or inactive grants authorize nothing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum lifetime of a write-capable (L2/L3) grant.
pub const MAX_GRANT_DAYS: i64 = 7;

/// Number of distinct-group approvals required for an L3 grant.
pub const L3_REQUIRED_APPROVALS: usize = 2;

/// Provider access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Read public data only.
    L0,
    /// Read data scoped to the group.
    L1,
    /// Write data scoped to the group.
    L2,
    /// High-risk operations (deletion, money movement, deployment).
    L3,
}

impl AccessLevel {
    /// Parses the numeric wire form (0..=3).
    #[must_use]
    pub const fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::L0),
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            3 => Some(Self::L3),
            _ => None,
        }
    }

    /// Returns the numeric wire form.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::L0 => 0,
            Self::L1 => 1,
            Self::L2 => 2,
            Self::L3 => 3,
        }
    }
}

/// One capability grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Group the grant belongs to.
    pub group_folder: String,
    /// Provider the grant covers.
    pub provider: String,
    /// Granted access level.
    pub access_level: AccessLevel,
    /// Allow list; empty means any action within the level envelope.
    pub allowed_actions: Vec<String>,
    /// Deny list; wins over the allow list.
    pub denied_actions: Vec<String>,
    /// Who granted it.
    pub granted_by: String,
    /// When it was granted (UTC ISO-8601).
    pub granted_at: String,
    /// Expiry; required for L2/L3.
    pub expires_at: Option<String>,
    /// Whether the grant is currently active.
    pub active: bool,
}

impl Capability {
    /// Returns true when the grant has expired as of `now_iso`.
    ///
    /// ISO-8601 UTC strings compare lexicographically, so no parsing is
    /// needed on the hot path.
    #[must_use]
    pub fn is_expired(&self, now_iso: &str) -> bool {
        self.expires_at
            .as_deref()
            .map_or(false, |expiry| expiry <= now_iso)
    }
}

/// Denial produced by a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDenial {
    /// No active, unexpired capability for `(group, provider)`.
    NoCapability,
    /// The action appears in the deny list.
    DeniedByPolicy,
    /// An allow list is present and the action is not in it.
    NotAllowed,
    /// The action's required level exceeds the granted level.
    InsufficientLevel,
}

impl CapabilityDenial {
    /// Returns the wire code for this denial.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoCapability => "NO_CAPABILITY",
            Self::DeniedByPolicy => "DENIED_BY_POLICY",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::InsufficientLevel => "INSUFFICIENT_LEVEL",
        }
    }
}

/// Classifies an action name to its required access level.
///
/// Classification keys on the action's verb prefix. Unknown verbs are
/// high-risk: misclassifying a destructive action as a read would be an
/// authorization bypass, so the default is `L3`.
#[must_use]
pub fn required_level(action: &str) -> AccessLevel {
    let verb = action
        .split(|c: char| c == '.' || c == ':' || c == '/' || c == '_')
        .next()
        .unwrap_or(action);
    match verb {
        "browse" | "search" => AccessLevel::L0,
        "read" | "get" | "list" | "fetch" | "status" | "query" => AccessLevel::L1,
        "write" | "create" | "update" | "send" | "post" | "upload" | "comment" => AccessLevel::L2,
        _ => AccessLevel::L3,
    }
}

/// Checks whether `cap` authorizes `action`, in deny-wins order.
///
/// Returns `None` when allowed. The caller has already established the
/// grant is active and unexpired.
#[must_use]
pub fn check_action(cap: &Capability, action: &str) -> Option<CapabilityDenial> {
    if cap.denied_actions.iter().any(|a| a == action) {
        return Some(CapabilityDenial::DeniedByPolicy);
    }
    if !cap.allowed_actions.is_empty() && !cap.allowed_actions.iter().any(|a| a == action) {
        return Some(CapabilityDenial::NotAllowed);
    }
    if required_level(action) > cap.access_level {
        return Some(CapabilityDenial::InsufficientLevel);
    }
    None
}

/// Errors raised when validating a new grant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    /// L2/L3 grants must carry an expiry.
    #[error("access level {level:?} requires expires_at")]
    ExpiryRequired {
        /// The offending level.
        level: AccessLevel,
    },

    /// The expiry exceeds the seven-day bound.
    #[error("expires_at exceeds granted_at + {MAX_GRANT_DAYS} days")]
    ExpiryTooFar,

    /// The expiry or grant timestamp failed to parse.
    #[error("invalid timestamp: {value}")]
    BadTimestamp {
        /// The unparseable value.
        value: String,
    },

    /// L3 grants need two prior approvals from distinct groups.
    #[error("L3 grants require {L3_REQUIRED_APPROVALS} approvals from distinct groups (got {got})")]
    DualApprovalRequired {
        /// Number of distinct approving groups supplied.
        got: usize,
    },
}

/// Validates the invariants of a new grant: L2/L3 expiry within seven
/// days of `granted_at`, and two distinct-group approvals for L3.
///
/// # Errors
///
/// Returns the first violated [`GrantError`].
pub fn validate_grant(
    level: AccessLevel,
    granted_at: &str,
    expires_at: Option<&str>,
    approver_groups: &[String],
) -> Result<(), GrantError> {
    if level >= AccessLevel::L2 {
        let Some(expiry) = expires_at else {
            return Err(GrantError::ExpiryRequired { level });
        };
        let granted = parse_ts(granted_at)?;
        let expires = parse_ts(expiry)?;
        if expires > granted + Duration::days(MAX_GRANT_DAYS) {
            return Err(GrantError::ExpiryTooFar);
        }
    }

    if level == AccessLevel::L3 {
        let mut distinct: Vec<&str> = approver_groups.iter().map(String::as_str).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < L3_REQUIRED_APPROVALS {
            return Err(GrantError::DualApprovalRequired {
                got: distinct.len(),
            });
        }
    }

    Ok(())
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, GrantError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| GrantError::BadTimestamp {
            value: value.to_string(),
        })
}

/// Lifecycle status of an external call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtCallStatus {
    /// Authorized, not yet handed to the executor.
    Authorized,
    /// Executor has picked it up.
    Processing,
    /// Completed successfully.
    Executed,
    /// Rejected by policy; never executed.
    Denied,
    /// Executor reported failure.
    Failed,
    /// Executor deadline elapsed.
    Timeout,
}

impl ExtCallStatus {
    /// Returns the wire string for this value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authorized => "authorized",
            Self::Processing => "processing",
            Self::Executed => "executed",
            Self::Denied => "denied",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    /// Parses the wire string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authorized" => Some(Self::Authorized),
            "processing" => Some(Self::Processing),
            "executed" => Some(Self::Executed),
            "denied" => Some(Self::Denied),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Returns true for the pending set counted against backpressure.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Authorized | Self::Processing)
    }

    /// Returns true for terminal statuses eligible for cleanup.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Denied | Self::Failed | Self::Timeout
        )
    }

    /// Returns true when `next` is a legal executor-reported successor.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Authorized, Self::Processing)
                | (
                    Self::Authorized | Self::Processing,
                    Self::Executed | Self::Failed | Self::Timeout
                )
        )
    }
}

/// One audited external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtCall {
    /// Unique request identifier.
    pub request_id: String,
    /// Calling group.
    pub group_folder: String,
    /// Target provider.
    pub provider: String,
    /// Requested action.
    pub action: String,
    /// Access level the call was authorized at.
    pub access_level: AccessLevel,
    /// HMAC-SHA256 over the canonical parameters. Raw values are never
    /// stored.
    pub params_hmac: String,
    /// Sanitized human-readable parameter summary.
    pub params_summary: String,
    /// Lifecycle status.
    pub status: ExtCallStatus,
    /// Denial code when `status == denied`.
    pub denial_reason: Option<String>,
    /// Executor's result summary.
    pub result_summary: Option<String>,
    /// Scrubbed JSON response payload.
    pub response_data: Option<String>,
    /// Governed task the call is bound to.
    pub task_id: Option<String>,
    /// Product derived from the task, when product-scoped.
    pub product_id: Option<String>,
    /// Client idempotency key.
    pub idempotency_key: Option<String>,
    /// Wall-clock duration reported by the executor.
    pub duration_ms: Option<i64>,
    /// Creation timestamp.
    pub created_at: String,
}
