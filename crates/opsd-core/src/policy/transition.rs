//! The workflow graph and its strict-mode validators.

use std::fmt;

use serde::Serialize;

use crate::task::{Task, TaskState, TaskType};

/// Machine-readable reason a transition was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyCode {
    /// The source state has no outgoing edges (reserved or terminal-unknown).
    UnknownState,
    /// The `(from, to)` edge is not in the graph.
    InvalidTransition,
    /// Strict: the task has no priority.
    MissingPriority,
    /// Strict: the task has no owner.
    MissingOwner,
    /// Strict: entering DOING without a DoD checklist.
    MissingDodChecklist,
    /// Strict: entering DOING without declaring `evidenceRequired`.
    MissingEvidenceRequired,
    /// Strict: `DOING -> REVIEW` without a review summary.
    MissingReviewSummary,
    /// Strict: leaving REVIEW with `evidenceRequired` but no evidence link.
    MissingEvidenceLink,
    /// Strict: entering DONE with unchecked DoD items.
    DodIncomplete,
    /// Strict: SECURITY task entering DONE without `docsUpdated`.
    DocsNotUpdated,
    /// Strict: entering DONE with an unapproved gate and no override.
    GateNotApproved,
    /// Strict: the override is missing `by`.
    OverrideMissingBy,
    /// Strict: the override is missing `reason`.
    OverrideMissingReason,
    /// Strict: the override is missing `acceptedRisk`.
    OverrideMissingAcceptedRisk,
    /// Strict: the override is missing `reviewDeadlineIso`.
    OverrideMissingReviewDeadline,
}

impl PolicyCode {
    /// Returns the wire code for this denial.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownState => "UNKNOWN_STATE",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::MissingPriority => "MISSING_PRIORITY",
            Self::MissingOwner => "MISSING_OWNER",
            Self::MissingDodChecklist => "MISSING_DOD_CHECKLIST",
            Self::MissingEvidenceRequired => "MISSING_EVIDENCE_REQUIRED",
            Self::MissingReviewSummary => "MISSING_REVIEW_SUMMARY",
            Self::MissingEvidenceLink => "MISSING_EVIDENCE_LINK",
            Self::DodIncomplete => "DOD_INCOMPLETE",
            Self::DocsNotUpdated => "DOCS_NOT_UPDATED",
            Self::GateNotApproved => "GATE_NOT_APPROVED",
            Self::OverrideMissingBy => "OVERRIDE_MISSING_BY",
            Self::OverrideMissingReason => "OVERRIDE_MISSING_REASON",
            Self::OverrideMissingAcceptedRisk => "OVERRIDE_MISSING_ACCEPTED_RISK",
            Self::OverrideMissingReviewDeadline => "OVERRIDE_MISSING_REVIEW_DEADLINE_ISO",
        }
    }
}

impl fmt::Display for PolicyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts the engine supplies alongside the task for strict validation.
///
/// Approval lookups live in the store, so the engine resolves them before
/// calling the kernel; the kernel itself never touches the database.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionFacts<'a> {
    /// Snapshot of the task being transitioned.
    pub task: Option<&'a Task>,
    /// Caller-supplied review summary for `DOING -> REVIEW`.
    pub review_summary: Option<&'a str>,
    /// Whether an approval matching the task's gate exists.
    pub gate_approved: bool,
    /// Whether any approval on the task carries an evidence link.
    pub approval_evidence_link: bool,
}

/// Result of a transition validation.
#[derive(Debug, Clone)]
pub struct TransitionCheck {
    /// True when the transition may proceed.
    pub ok: bool,
    /// True when `from == to`; the caller treats this as success, writes
    /// no activity, and does not bump the version.
    pub no_op: bool,
    /// Denial codes, empty when `ok`.
    pub errors: Vec<PolicyCode>,
}

impl TransitionCheck {
    fn pass() -> Self {
        Self {
            ok: true,
            no_op: false,
            errors: Vec::new(),
        }
    }

    fn no_op() -> Self {
        Self {
            ok: true,
            no_op: true,
            errors: Vec::new(),
        }
    }

    fn fail(errors: Vec<PolicyCode>) -> Self {
        Self {
            ok: false,
            no_op: false,
            errors,
        }
    }
}

/// Returns the allowed target states for `from`.
///
/// `DONE` is terminal and `KILLED` is reserved; both return an empty slice.
#[must_use]
pub const fn allowed_targets(from: TaskState) -> &'static [TaskState] {
    use TaskState::{Approval, Blocked, Doing, Done, Inbox, Ready, Review, Triaged};
    match from {
        Inbox => &[Triaged, Blocked],
        Triaged => &[Ready, Blocked],
        Ready => &[Doing, Blocked],
        Doing => &[Review, Blocked],
        Review => &[Approval, Doing, Blocked],
        Approval => &[Done, Review, Blocked],
        Blocked => &[Inbox, Triaged, Ready, Doing],
        Done | TaskState::Killed => &[],
    }
}

/// Validates a transition against the graph and, in strict mode, the
/// additional quality validators.
///
/// Same-state transitions validate as a no-op. All strict failures are
/// collected rather than short-circuited so the caller can report every
/// unmet requirement at once.
#[must_use]
pub fn validate_transition(
    from: TaskState,
    to: TaskState,
    facts: &TransitionFacts<'_>,
    strict: bool,
) -> TransitionCheck {
    if from == to {
        return TransitionCheck::no_op();
    }

    // KILLED is reserved: nothing enters or leaves it through this path.
    if from == TaskState::Killed {
        return TransitionCheck::fail(vec![PolicyCode::UnknownState]);
    }

    if !allowed_targets(from).contains(&to) {
        return TransitionCheck::fail(vec![PolicyCode::InvalidTransition]);
    }

    if !strict {
        return TransitionCheck::pass();
    }

    let mut errors = Vec::new();
    if let Some(task) = facts.task {
        strict_entry_checks(task, &mut errors);

        if to == TaskState::Doing {
            strict_doing_checks(task, &mut errors);
        }

        if from == TaskState::Doing && to == TaskState::Review {
            let blank = facts
                .review_summary
                .map_or(true, |s| s.trim().is_empty());
            if blank {
                errors.push(PolicyCode::MissingReviewSummary);
            }
        }

        if from == TaskState::Review && task.metadata.evidence_required == Some(true) {
            let has_link =
                task.metadata.audit_link.is_some() || facts.approval_evidence_link;
            if !has_link {
                errors.push(PolicyCode::MissingEvidenceLink);
            }
        }

        if to == TaskState::Done {
            strict_done_checks(task, facts.gate_approved, &mut errors);
        }
    }

    if errors.is_empty() {
        TransitionCheck::pass()
    } else {
        TransitionCheck::fail(errors)
    }
}

fn strict_entry_checks(task: &Task, errors: &mut Vec<PolicyCode>) {
    // Priority is a typed column today; the check guards rows predating it.
    if task.priority.as_str().is_empty() {
        errors.push(PolicyCode::MissingPriority);
    }
    let owner_present = task
        .metadata
        .owner
        .as_deref()
        .map_or(false, |o| !o.trim().is_empty())
        || !task.assigned_group.trim().is_empty();
    if !owner_present {
        errors.push(PolicyCode::MissingOwner);
    }
}

fn strict_doing_checks(task: &Task, errors: &mut Vec<PolicyCode>) {
    let checklist_present = task
        .metadata
        .dod_checklist
        .as_deref()
        .map_or(false, |c| !c.is_empty())
        || task
            .metadata
            .dod_status
            .as_deref()
            .map_or(false, |s| !s.is_empty());
    if !checklist_present {
        errors.push(PolicyCode::MissingDodChecklist);
    }
    if task.metadata.evidence_required.is_none() {
        errors.push(PolicyCode::MissingEvidenceRequired);
    }
}

fn strict_done_checks(task: &Task, gate_approved: bool, errors: &mut Vec<PolicyCode>) {
    // Completion is judged on tracked statuses; a checklist that was
    // never tracked has nothing recorded as undone.
    let incomplete = task
        .metadata
        .dod_status
        .as_deref()
        .map_or(false, |items| items.iter().any(|i| !i.done));
    if incomplete {
        errors.push(PolicyCode::DodIncomplete);
    }

    if task.task_type == TaskType::Security && task.metadata.docs_updated != Some(true) {
        errors.push(PolicyCode::DocsNotUpdated);
    }

    if task.gate != crate::task::Gate::None && !gate_approved {
        match &task.metadata.override_record {
            Some(rec) if rec.is_complete() => {}
            Some(rec) => {
                for field in rec.missing_fields() {
                    errors.push(match field {
                        "by" => PolicyCode::OverrideMissingBy,
                        "reason" => PolicyCode::OverrideMissingReason,
                        "acceptedRisk" => PolicyCode::OverrideMissingAcceptedRisk,
                        _ => PolicyCode::OverrideMissingReviewDeadline,
                    });
                }
            }
            None => errors.push(PolicyCode::GateNotApproved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{
        DodItem, Gate, OverrideRecord, Priority, Scope, TaskMetadata, TaskType,
    };

    fn task(state: TaskState) -> Task {
        Task {
            id: "gov-20260802T090000Z-abc123".to_string(),
            title: "test".to_string(),
            description: None,
            task_type: TaskType::Feature,
            state,
            priority: Priority::P2,
            scope: Scope::Company,
            product_id: None,
            assigned_group: "developer".to_string(),
            executor: None,
            created_by: "main".to_string(),
            gate: Gate::None,
            dod_required: false,
            metadata: TaskMetadata::default(),
            version: 1,
            created_at: "2026-08-02T09:00:00.000Z".to_string(),
            updated_at: "2026-08-02T09:00:00.000Z".to_string(),
        }
    }

    mod graph_tests {
        use super::*;

        #[test]
        fn test_happy_path_edges() {
            let edges = [
                (TaskState::Inbox, TaskState::Triaged),
                (TaskState::Triaged, TaskState::Ready),
                (TaskState::Ready, TaskState::Doing),
                (TaskState::Doing, TaskState::Review),
                (TaskState::Review, TaskState::Approval),
                (TaskState::Approval, TaskState::Done),
            ];
            for (from, to) in edges {
                let check = validate_transition(from, to, &TransitionFacts::default(), false);
                assert!(check.ok, "{from} -> {to} should be allowed");
            }
        }

        #[test]
        fn test_rework_and_block_edges() {
            for (from, to) in [
                (TaskState::Review, TaskState::Doing),
                (TaskState::Approval, TaskState::Review),
                (TaskState::Blocked, TaskState::Inbox),
                (TaskState::Blocked, TaskState::Doing),
            ] {
                assert!(
                    validate_transition(from, to, &TransitionFacts::default(), false).ok,
                    "{from} -> {to} should be allowed"
                );
            }
        }

        #[test]
        fn test_missing_edge_denied() {
            let check = validate_transition(
                TaskState::Inbox,
                TaskState::Done,
                &TransitionFacts::default(),
                false,
            );
            assert!(!check.ok);
            assert_eq!(check.errors, vec![PolicyCode::InvalidTransition]);
        }

        #[test]
        fn test_done_is_terminal() {
            for to in [TaskState::Inbox, TaskState::Doing, TaskState::Review] {
                let check = validate_transition(
                    TaskState::Done,
                    to,
                    &TransitionFacts::default(),
                    false,
                );
                assert!(!check.ok);
            }
        }

        #[test]
        fn test_killed_is_unknown_source() {
            let check = validate_transition(
                TaskState::Killed,
                TaskState::Inbox,
                &TransitionFacts::default(),
                false,
            );
            assert_eq!(check.errors, vec![PolicyCode::UnknownState]);
        }

        #[test]
        fn test_same_state_is_no_op() {
            let check = validate_transition(
                TaskState::Doing,
                TaskState::Doing,
                &TransitionFacts::default(),
                true,
            );
            assert!(check.ok);
            assert!(check.no_op);
        }
    }

    mod strict_tests {
        use super::*;

        #[test]
        fn test_doing_requires_checklist_and_evidence_flag() {
            let t = task(TaskState::Ready);
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            let check = validate_transition(TaskState::Ready, TaskState::Doing, &facts, true);
            assert!(!check.ok);
            assert!(check.errors.contains(&PolicyCode::MissingDodChecklist));
            assert!(check.errors.contains(&PolicyCode::MissingEvidenceRequired));
        }

        #[test]
        fn test_doing_passes_with_checklist() {
            let mut t = task(TaskState::Ready);
            t.metadata.dod_checklist = Some(vec!["write the tests".to_string()]);
            t.metadata.evidence_required = Some(false);
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            assert!(validate_transition(TaskState::Ready, TaskState::Doing, &facts, true).ok);
        }

        #[test]
        fn test_review_requires_summary() {
            let t = task(TaskState::Doing);
            let facts = TransitionFacts {
                task: Some(&t),
                review_summary: Some("   "),
                ..Default::default()
            };
            let check = validate_transition(TaskState::Doing, TaskState::Review, &facts, true);
            assert!(check.errors.contains(&PolicyCode::MissingReviewSummary));

            let facts = TransitionFacts {
                task: Some(&t),
                review_summary: Some("Done implementing"),
                ..Default::default()
            };
            assert!(validate_transition(TaskState::Doing, TaskState::Review, &facts, true).ok);
        }

        #[test]
        fn test_leaving_review_requires_evidence_link() {
            let mut t = task(TaskState::Review);
            t.metadata.evidence_required = Some(true);
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            let check =
                validate_transition(TaskState::Review, TaskState::Approval, &facts, true);
            assert!(check.errors.contains(&PolicyCode::MissingEvidenceLink));

            // An audit link satisfies the requirement.
            t.metadata.audit_link = Some("https://audit.example/run/1".to_string());
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            assert!(
                validate_transition(TaskState::Review, TaskState::Approval, &facts, true).ok
            );
        }

        #[test]
        fn test_approval_evidence_link_also_satisfies() {
            let mut t = task(TaskState::Review);
            t.metadata.evidence_required = Some(true);
            let facts = TransitionFacts {
                task: Some(&t),
                approval_evidence_link: true,
                ..Default::default()
            };
            assert!(
                validate_transition(TaskState::Review, TaskState::Approval, &facts, true).ok
            );
        }

        #[test]
        fn test_done_requires_complete_dod() {
            let mut t = task(TaskState::Approval);
            t.metadata.dod_status = Some(vec![
                DodItem {
                    id: "dod-a1".to_string(),
                    text: "write tests".to_string(),
                    done: true,
                },
                DodItem {
                    id: "dod-a2".to_string(),
                    text: "update docs".to_string(),
                    done: false,
                },
            ]);
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            let check = validate_transition(TaskState::Approval, TaskState::Done, &facts, true);
            assert!(check.errors.contains(&PolicyCode::DodIncomplete));
        }

        #[test]
        fn test_security_task_requires_docs_updated() {
            let mut t = task(TaskState::Approval);
            t.task_type = TaskType::Security;
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            let check = validate_transition(TaskState::Approval, TaskState::Done, &facts, true);
            assert!(check.errors.contains(&PolicyCode::DocsNotUpdated));
        }

        #[test]
        fn test_gate_requires_approval_or_override() {
            let mut t = task(TaskState::Approval);
            t.gate = Gate::Security;
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            let check = validate_transition(TaskState::Approval, TaskState::Done, &facts, true);
            assert!(check.errors.contains(&PolicyCode::GateNotApproved));

            let facts = TransitionFacts {
                task: Some(&t),
                gate_approved: true,
                ..Default::default()
            };
            assert!(validate_transition(TaskState::Approval, TaskState::Done, &facts, true).ok);
        }

        #[test]
        fn test_partial_override_names_missing_fields() {
            let mut t = task(TaskState::Approval);
            t.gate = Gate::Product;
            t.metadata.override_record = Some(OverrideRecord {
                by: Some("main".to_string()),
                reason: Some("launch window".to_string()),
                ..Default::default()
            });
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            let check = validate_transition(TaskState::Approval, TaskState::Done, &facts, true);
            assert!(check
                .errors
                .contains(&PolicyCode::OverrideMissingAcceptedRisk));
            assert!(check
                .errors
                .contains(&PolicyCode::OverrideMissingReviewDeadline));
            assert!(!check.errors.contains(&PolicyCode::GateNotApproved));
        }

        #[test]
        fn test_complete_override_bypasses_gate() {
            let mut t = task(TaskState::Approval);
            t.gate = Gate::Claims;
            t.metadata.override_record = Some(OverrideRecord {
                by: Some("main".to_string()),
                reason: Some("founder call".to_string()),
                accepted_risk: Some("claim unverified for 7 days".to_string()),
                review_deadline_iso: Some("2026-08-09T00:00:00.000Z".to_string()),
            });
            let facts = TransitionFacts {
                task: Some(&t),
                ..Default::default()
            };
            assert!(validate_transition(TaskState::Approval, TaskState::Done, &facts, true).ok);
        }
    }
}
