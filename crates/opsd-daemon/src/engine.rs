//! The governance engine.
//!
//! Every mutation of governed state goes through one of the command
//! methods here. Each command:
//!
//! 1. takes the store's write lock and opens one transaction,
//! 2. runs its pre-checks (existence, authorization, policy kernel),
//! 3. applies row changes plus the audit activity row,
//! 4. commits - or rolls back leaving the database byte-identical.
//!
//! Version arithmetic is part of the contract: every successful mutating
//! command bumps the task's `version` by exactly one; a same-state
//! transition writes nothing and bumps nothing. Events are published only
//! after the transaction commits, so subscribers never observe state that
//! later rolled back.

use opsd_core::capability::ExtCallStatus;
use opsd_core::events::{BusEvent, EventBus};
use opsd_core::group::{GroupRegistry, MAIN, SYSTEM_ACTOR};
use opsd_core::id::{new_dod_id, new_task_id, new_topic_id, now_iso};
use opsd_core::policy::{
    check_approver, check_approver_not_executor, validate_transition, TransitionFacts,
};
use opsd_core::record::{
    Activity, ActivityAction, Approval, ChatMessage, Topic, MAX_MARK_READ_IDS, MAX_SNIPPET_LEN,
};
use opsd_core::scrub::{normalize_actor, parse_mentions, sanitize_comment};
use opsd_core::task::{
    DodItem, EvidenceEntry, Gate, OverrideRecord, Priority, Scope, Task, TaskMetadata, TaskState,
    TaskType, DOD_TEXT_MAX, DOD_TEXT_MIN, MAX_BULK_EVIDENCE_LINKS, MAX_DOD_ITEMS,
    MAX_EVIDENCE_LINK_LEN, MAX_EVIDENCE_NOTE_LEN, MAX_TITLE_LEN,
};
use tracing::{info, warn};

use crate::store::activities::NewActivity;
use crate::store::{activities, approvals, chat, ext_calls, notifications, products, tasks};
use crate::store::{Store, StoreError};

/// Reason recorded on a scope-coercion activity.
pub const COERCE_SCOPE_REASON: &str = "PRODUCT_SCOPE_WITHOUT_PRODUCT_ID";

/// Attempts at minting a non-colliding task id before giving up.
const ID_RETRY_LIMIT: usize = 5;

/// Errors surfaced by governance commands.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier that missed.
        id: String,
    },

    /// The actor may not run this command.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Denial code or description.
        reason: String,
    },

    /// Input failed validation; the message names the field or bound.
    #[error("{0}")]
    Validation(String),

    /// The caller's `expectedVersion` no longer matches.
    #[error("version conflict: expected {expected}, found {found}")]
    StaleVersion {
        /// Version the caller read.
        expected: i64,
        /// Version currently stored.
        found: i64,
    },

    /// The policy kernel denied the command.
    #[error("policy denied: {}", .codes.join(", "))]
    PolicyDenied {
        /// Kernel reason codes.
        codes: Vec<String>,
    },

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GovernanceError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Input for the create command.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    /// Task title (1..=140 chars).
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Task type; drives template defaults.
    pub task_type: TaskType,
    /// Priority; defaults to P2.
    pub priority: Option<Priority>,
    /// Scope; defaults to COMPANY.
    pub scope: Option<Scope>,
    /// Product binding for PRODUCT scope.
    pub product_id: Option<String>,
    /// Assigned group; defaults from the type template.
    pub assigned_group: Option<String>,
    /// Executor identity.
    pub executor: Option<String>,
    /// Gate; defaults from the type template.
    pub gate: Option<Gate>,
    /// Whether a DoD checklist is mandatory.
    pub dod_required: Option<bool>,
    /// Initial DoD checklist; defaults from the type template.
    pub dod_checklist: Option<Vec<String>>,
}

/// Input for one DoD item in a DoD update.
#[derive(Debug, Clone)]
pub struct DodItemInput {
    /// Existing stable id, preserved when it matches `^dod-[a-z0-9]+$`.
    pub id: Option<String>,
    /// Item text.
    pub text: String,
    /// Completion flag.
    pub done: bool,
}

/// Result of the create command.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// The minted task id.
    pub task_id: String,
    /// Always `INBOX`.
    pub state: TaskState,
}

/// Result of a transition command.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// State after the command.
    pub state: TaskState,
    /// Version after the command.
    pub version: i64,
    /// True when the transition was a same-state no-op.
    pub no_op: bool,
}

/// Result of a comment command.
#[derive(Debug, Clone)]
pub struct CommentOutcome {
    /// Groups that were mentioned and notified.
    pub mentions: Vec<String>,
    /// Ids of the created notification rows.
    pub notification_ids: Vec<i64>,
}

/// The engine. Cheap to clone; all clones share the single writer.
#[derive(Debug, Clone)]
pub struct GovernanceEngine {
    store: Store,
    bus: EventBus,
    registry: GroupRegistry,
    strict: bool,
}

impl GovernanceEngine {
    /// Creates an engine over the given store and bus.
    #[must_use]
    pub fn new(store: Store, bus: EventBus, registry: GroupRegistry, strict: bool) -> Self {
        Self {
            store,
            bus,
            registry,
            strict,
        }
    }

    /// Returns the store handle (read paths go straight to it).
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the group registry.
    #[must_use]
    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    /// Returns whether strict mode is engaged.
    #[must_use]
    pub fn strict(&self) -> bool {
        self.strict
    }

    // -----------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------

    /// Creates a task in `INBOX`.
    ///
    /// Only `main` (or the system) may create. Scope and product are
    /// normalized: PRODUCT scope without a product id coerces to COMPANY
    /// with an audit trail; COMPANY scope with a product id is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] on authorization, validation, or
    /// store failure.
    pub fn create(&self, actor: &str, input: CreateTask) -> Result<CreateOutcome, GovernanceError> {
        if actor != MAIN && actor != SYSTEM_ACTOR {
            return Err(GovernanceError::Forbidden {
                reason: "only main may create tasks".to_string(),
            });
        }

        let title_len = input.title.chars().count();
        if title_len == 0 || title_len > MAX_TITLE_LEN {
            return Err(GovernanceError::validation(format!(
                "title must be 1..{MAX_TITLE_LEN} characters"
            )));
        }

        let mut scope = input.scope.unwrap_or(Scope::Company);
        let product_id = input.product_id.clone();
        let mut coerced = false;
        match (scope, &product_id) {
            (Scope::Company, Some(_)) => {
                return Err(GovernanceError::validation(
                    "COMPANY scope must not carry product_id",
                ));
            }
            (Scope::Product, None) => {
                scope = Scope::Company;
                coerced = true;
            }
            _ => {}
        }

        let template = input.task_type.template();
        let assigned_group = input
            .assigned_group
            .unwrap_or_else(|| template.assigned_group.to_string());
        self.registry
            .require(&assigned_group)
            .map_err(|e| GovernanceError::validation(e.to_string()))?;
        let gate = input.gate.unwrap_or(template.gate);

        let mut metadata = TaskMetadata::default();
        metadata.stamp_policy_version();
        // Declared up front so strict DOING entry has a boolean to check;
        // there is no later command that sets it.
        metadata.evidence_required = Some(false);
        let checklist = input.dod_checklist.or_else(|| {
            if template.dod_checklist.is_empty() {
                None
            } else {
                Some(
                    template
                        .dod_checklist
                        .iter()
                        .map(|s| (*s).to_string())
                        .collect(),
                )
            }
        });
        metadata.dod_checklist = checklist;

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;

        if let Some(pid) = &product_id {
            match products::get(&tx, pid)? {
                None => return Err(GovernanceError::not_found("product", pid)),
                Some(product) if product.status == opsd_core::product::ProductStatus::Killed => {
                    return Err(GovernanceError::validation(format!(
                        "product {pid} is killed; tasks may not target it"
                    )));
                }
                Some(_) => {}
            }
        }

        let now = now_iso();
        let mut task = Task {
            id: String::new(),
            title: input.title,
            description: input.description,
            task_type: input.task_type,
            state: TaskState::Inbox,
            priority: input.priority.unwrap_or_default(),
            scope,
            product_id,
            assigned_group,
            executor: input.executor,
            created_by: actor.to_string(),
            gate,
            dod_required: input.dod_required.unwrap_or(false),
            metadata,
            version: 1,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        // Id collisions are possible within one wall-clock second;
        // retry with a fresh suffix until the unique constraint passes.
        let mut attempts = 0;
        loop {
            task.id = new_task_id();
            match tasks::insert(&tx, &task) {
                Ok(()) => break,
                Err(err) if is_unique_violation(&err) && attempts < ID_RETRY_LIMIT => {
                    attempts += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        activities::append(
            &tx,
            &NewActivity {
                task_id: &task.id,
                action: ActivityAction::Create,
                from_state: None,
                to_state: Some(TaskState::Inbox),
                actor,
                reason: None,
                created_at: &now,
            },
        )?;

        if coerced {
            activities::append(
                &tx,
                &NewActivity {
                    task_id: &task.id,
                    action: ActivityAction::CoerceScope,
                    from_state: None,
                    to_state: None,
                    actor: SYSTEM_ACTOR,
                    reason: Some(COERCE_SCOPE_REASON),
                    created_at: &now,
                },
            )?;
        }

        tx.commit().map_err(StoreError::from)?;
        info!(task_id = %task.id, actor, "task created");

        Ok(CreateOutcome {
            task_id: task.id,
            state: TaskState::Inbox,
        })
    }

    // -----------------------------------------------------------------
    // Transition
    // -----------------------------------------------------------------

    /// Transitions a task along the workflow graph.
    ///
    /// `main` may always transition; the assigned group may transition
    /// its own task. In strict mode `DOING -> REVIEW` requires a
    /// non-blank `reason`, which is additionally logged as an
    /// `execution_summary` activity in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] on authorization, policy, version, or
    /// store failure.
    pub fn transition(
        &self,
        actor: &str,
        task_id: &str,
        to: TaskState,
        reason: Option<&str>,
        expected_version: Option<i64>,
    ) -> Result<TransitionOutcome, GovernanceError> {
        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;

        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        if let Some(expected) = expected_version {
            if expected != task.version {
                return Err(GovernanceError::StaleVersion {
                    expected,
                    found: task.version,
                });
            }
        }

        if actor != MAIN && actor != task.assigned_group {
            return Err(GovernanceError::Forbidden {
                reason: format!("{actor} may not transition a task assigned to {}", task.assigned_group),
            });
        }

        let from = task.state;
        let gate_approved = task.gate != Gate::None
            && approvals::get(&tx, task_id, task.gate.as_str())?.is_some();
        let facts = TransitionFacts {
            task: Some(&task),
            review_summary: reason,
            gate_approved,
            approval_evidence_link: approvals::any_with_evidence_link(&tx, task_id)?,
        };
        let check = validate_transition(from, to, &facts, self.strict);
        if check.no_op {
            return Ok(TransitionOutcome {
                state: from,
                version: task.version,
                no_op: true,
            });
        }
        if !check.ok {
            return Err(GovernanceError::PolicyDenied {
                codes: check.errors.iter().map(|c| c.as_str().to_string()).collect(),
            });
        }

        let now = now_iso();
        task.state = to;
        tasks::update(&tx, &task, &now)?;

        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::Transition,
                from_state: Some(from),
                to_state: Some(to),
                actor,
                reason,
                created_at: &now,
            },
        )?;

        // Strict DOING -> REVIEW carries its summary as a second activity
        // in the same transaction: consumers observing one observe both.
        if self.strict && from == TaskState::Doing && to == TaskState::Review {
            let summary = reason.unwrap_or("").trim();
            activities::append(
                &tx,
                &NewActivity {
                    task_id,
                    action: ActivityAction::ExecutionSummary,
                    from_state: None,
                    to_state: None,
                    actor,
                    reason: Some(summary),
                    created_at: &now,
                },
            )?;
        }

        tx.commit().map_err(StoreError::from)?;
        info!(task_id, %from, %to, actor, "task transitioned");

        if to == TaskState::Ready {
            self.bus.publish(BusEvent::TaskReady {
                task_id: task_id.to_string(),
                assigned_group: task.assigned_group.clone(),
            });
        }

        Ok(TransitionOutcome {
            state: to,
            version: task.version + 1,
            no_op: false,
        })
    }

    // -----------------------------------------------------------------
    // Assign
    // -----------------------------------------------------------------

    /// Reassigns a task to a group (and optionally an executor).
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`]; only `main` may assign.
    pub fn assign(
        &self,
        actor: &str,
        task_id: &str,
        assigned_group: &str,
        executor: Option<&str>,
    ) -> Result<(), GovernanceError> {
        if actor != MAIN {
            return Err(GovernanceError::Forbidden {
                reason: "only main may assign".to_string(),
            });
        }
        self.registry
            .require(assigned_group)
            .map_err(|e| GovernanceError::validation(e.to_string()))?;

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        task.assigned_group = assigned_group.to_string();
        task.executor = executor.map(ToString::to_string);

        let now = now_iso();
        tasks::update(&tx, &task, &now)?;
        let reason = match executor {
            Some(exec) => format!("assigned to {assigned_group} (executor {exec})"),
            None => format!("assigned to {assigned_group}"),
        };
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::Assign,
                from_state: None,
                to_state: None,
                actor,
                reason: Some(&reason),
                created_at: &now,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Approve
    // -----------------------------------------------------------------

    /// Records a gate approval.
    ///
    /// Approvals may pre-record: the task's own gate need not equal
    /// `gate_type`. Idempotent per `(task, gate)` - a repeat replaces the
    /// earlier row - but every call appends its own `approve` activity.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Forbidden`] for wrong-group approvers
    /// and for approvers who are the task's executor.
    pub fn approve(
        &self,
        actor_group: &str,
        task_id: &str,
        gate_type: Gate,
        notes: Option<&str>,
        evidence_link: Option<&str>,
    ) -> Result<(), GovernanceError> {
        if gate_type == Gate::None {
            return Err(GovernanceError::validation("gate_type must name a gate"));
        }
        self.registry
            .require(actor_group)
            .map_err(|e| GovernanceError::validation(e.to_string()))?;

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        let is_main = actor_group == MAIN;
        if let Some(denial) = check_approver(gate_type, actor_group, is_main) {
            return Err(GovernanceError::Forbidden {
                reason: denial.as_str().to_string(),
            });
        }
        if let Some(denial) = check_approver_not_executor(actor_group, task.executor.as_deref()) {
            return Err(GovernanceError::Forbidden {
                reason: denial.as_str().to_string(),
            });
        }

        let now = now_iso();
        approvals::upsert(
            &tx,
            &Approval {
                task_id: task_id.to_string(),
                gate_type: gate_type.as_str().to_string(),
                approved_by: actor_group.to_string(),
                notes: notes.map(ToString::to_string),
                evidence_link: evidence_link.map(ToString::to_string),
                created_at: now.clone(),
            },
        )?;
        tasks::update(&tx, &task, &now)?;
        let reason = format!("gate {gate_type} approved by {actor_group}");
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::Approve,
                from_state: None,
                to_state: None,
                actor: actor_group,
                reason: Some(&reason),
                created_at: &now,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Override
    // -----------------------------------------------------------------

    /// Issues a founder override, bypassing the gate.
    ///
    /// When the task sits in `APPROVAL`, the override also moves it to
    /// `DONE` in the same transaction; both the `override` and the
    /// `transition` activity are logged.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`]; only `main` may override. Strict
    /// non-gate DONE checks (DoD completion, docs flag) still apply.
    pub fn override_gate(
        &self,
        actor: &str,
        task_id: &str,
        reason: &str,
        accepted_risk: &str,
        review_deadline_iso: &str,
    ) -> Result<TaskState, GovernanceError> {
        if actor != MAIN {
            return Err(GovernanceError::Forbidden {
                reason: "only main may override".to_string(),
            });
        }
        for (field, value) in [
            ("reason", reason),
            ("acceptedRisk", accepted_risk),
            ("reviewDeadlineIso", review_deadline_iso),
        ] {
            if value.trim().is_empty() {
                return Err(GovernanceError::validation(format!(
                    "{field} must not be empty"
                )));
            }
        }

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        task.metadata.override_record = Some(OverrideRecord {
            by: Some(actor.to_string()),
            reason: Some(reason.to_string()),
            accepted_risk: Some(accepted_risk.to_string()),
            review_deadline_iso: Some(review_deadline_iso.to_string()),
        });

        let from = task.state;
        let completes = from == TaskState::Approval;
        if completes {
            // The override satisfies the gate; every other strict DONE
            // requirement still applies.
            let facts = TransitionFacts {
                task: Some(&task),
                ..Default::default()
            };
            let check = validate_transition(from, TaskState::Done, &facts, self.strict);
            if !check.ok {
                return Err(GovernanceError::PolicyDenied {
                    codes: check.errors.iter().map(|c| c.as_str().to_string()).collect(),
                });
            }
            task.state = TaskState::Done;
        }

        check_metadata_size(&task)?;
        let now = now_iso();
        tasks::update(&tx, &task, &now)?;
        let detail = format!("override by {actor}: {reason} (accepted risk: {accepted_risk}, review by {review_deadline_iso})");
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::Override,
                from_state: None,
                to_state: None,
                actor,
                reason: Some(&detail),
                created_at: &now,
            },
        )?;
        if completes {
            activities::append(
                &tx,
                &NewActivity {
                    task_id,
                    action: ActivityAction::Transition,
                    from_state: Some(TaskState::Approval),
                    to_state: Some(TaskState::Done),
                    actor,
                    reason: Some("gate overridden"),
                    created_at: &now,
                },
            )?;
        }
        tx.commit().map_err(StoreError::from)?;
        warn!(task_id, actor, "gate override issued");
        Ok(task.state)
    }

    // -----------------------------------------------------------------
    // Comment + notifications
    // -----------------------------------------------------------------

    /// Appends a comment and fans out mention notifications.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] for oversized or empty
    /// comments.
    pub fn comment(
        &self,
        actor: Option<&str>,
        task_id: &str,
        text: &str,
    ) -> Result<CommentOutcome, GovernanceError> {
        let sanitized =
            sanitize_comment(text).map_err(|e| GovernanceError::validation(e.to_string()))?;
        let actor = normalize_actor(actor);

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        let now = now_iso();
        tasks::update(&tx, &task, &now)?;
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::CommentAdded,
                from_state: None,
                to_state: None,
                actor: &actor,
                reason: Some(&sanitized),
                created_at: &now,
            },
        )?;

        let mentions = parse_mentions(&sanitized, &self.registry);
        let snippet: String = sanitized.chars().take(MAX_SNIPPET_LEN).collect();
        let mut notification_ids = Vec::with_capacity(mentions.len());
        for group in &mentions {
            let id = notifications::insert(&tx, task_id, group, &actor, &snippet, &now)?;
            notification_ids.push(id);
        }
        tx.commit().map_err(StoreError::from)?;

        for group in &mentions {
            self.bus.publish(BusEvent::NotificationCreated {
                task_id: task_id.to_string(),
                target_group: group.clone(),
                detail: serde_json::json!({ "actor": actor, "snippet": snippet }),
            });
        }

        Ok(CommentOutcome {
            mentions,
            notification_ids,
        })
    }

    /// Marks notification rows read, returning how many flipped.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] for an empty or oversized
    /// id batch.
    pub fn mark_notifications_read(&self, ids: &[i64]) -> Result<usize, GovernanceError> {
        if ids.is_empty() {
            return Err(GovernanceError::validation("ids must be a non-empty array"));
        }
        if ids.len() > MAX_MARK_READ_IDS {
            return Err(GovernanceError::validation(format!(
                "at most {MAX_MARK_READ_IDS} ids per markRead"
            )));
        }
        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let flipped = notifications::mark_read(&tx, ids)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(flipped)
    }

    // -----------------------------------------------------------------
    // DoD
    // -----------------------------------------------------------------

    /// Rewrites the task's DoD checklist, preserving stable item ids.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] on item-shape violations.
    pub fn dod_update(
        &self,
        actor: &str,
        task_id: &str,
        items: Vec<DodItemInput>,
    ) -> Result<(), GovernanceError> {
        if items.len() > MAX_DOD_ITEMS {
            return Err(GovernanceError::validation(format!(
                "at most {MAX_DOD_ITEMS} items"
            )));
        }

        let mut status = Vec::with_capacity(items.len());
        for item in items {
            let text = item.text.trim().to_string();
            let len = text.chars().count();
            if len < DOD_TEXT_MIN || len > DOD_TEXT_MAX {
                return Err(GovernanceError::validation(format!(
                    "each item text must be {DOD_TEXT_MIN}..{DOD_TEXT_MAX} characters after trimming"
                )));
            }
            let id = match item.id {
                Some(id) if is_dod_id(&id) => id,
                _ => new_dod_id(),
            };
            status.push(DodItem {
                id,
                text,
                done: item.done,
            });
        }

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        let done = status.iter().filter(|i| i.done).count();
        let total = status.len();
        let digest = opsd_core::digest::short_digest(
            &status
                .iter()
                .map(|i| i.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );

        task.metadata.dod_checklist = Some(status.iter().map(|i| i.text.clone()).collect());
        task.metadata.dod_status = Some(status);
        check_metadata_size(&task)?;

        let now = now_iso();
        tasks::update(&tx, &task, &now)?;
        let reason = format!("{done}/{total} h:{digest}");
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::DodUpdated,
                from_state: None,
                to_state: None,
                actor,
                reason: Some(&reason),
                created_at: &now,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Evidence
    // -----------------------------------------------------------------

    /// Appends one evidence entry.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] on link/note bounds.
    pub fn evidence(
        &self,
        actor: &str,
        task_id: &str,
        link: &str,
        note: Option<&str>,
    ) -> Result<usize, GovernanceError> {
        validate_evidence_link(link)?;
        if let Some(note) = note {
            if note.chars().count() > MAX_EVIDENCE_NOTE_LEN {
                return Err(GovernanceError::validation(format!(
                    "note exceeds {MAX_EVIDENCE_NOTE_LEN} characters"
                )));
            }
        }

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        let now = now_iso();
        task.metadata
            .evidence
            .get_or_insert_with(Vec::new)
            .push(EvidenceEntry {
                link: link.to_string(),
                note: note.map(ToString::to_string),
                added_at: now.clone(),
            });
        let count = task.metadata.evidence.as_ref().map_or(0, Vec::len);
        check_metadata_size(&task)?;

        tasks::update(&tx, &task, &now)?;
        let reason = match note {
            Some(note) => format!("{link} ({note})"),
            None => link.to_string(),
        };
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::EvidenceAdded,
                from_state: None,
                to_state: None,
                actor,
                reason: Some(&reason),
                created_at: &now,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(count)
    }

    /// Atomically appends up to 20 evidence entries with one shared
    /// `addedAt`.
    ///
    /// The audit reason carries the count, never the raw URLs.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] on count or link bounds.
    pub fn evidence_bulk(
        &self,
        actor: &str,
        task_id: &str,
        links: &[String],
        note: Option<&str>,
    ) -> Result<usize, GovernanceError> {
        if links.is_empty() {
            return Err(GovernanceError::validation(
                "links must be a non-empty array",
            ));
        }
        if links.len() > MAX_BULK_EVIDENCE_LINKS {
            return Err(GovernanceError::validation(format!(
                "at most {MAX_BULK_EVIDENCE_LINKS} links per bulk append"
            )));
        }
        for link in links {
            validate_evidence_link(link)?;
        }
        if let Some(note) = note {
            if note.chars().count() > MAX_EVIDENCE_NOTE_LEN {
                return Err(GovernanceError::validation(format!(
                    "note exceeds {MAX_EVIDENCE_NOTE_LEN} characters"
                )));
            }
        }

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        let now = now_iso();
        let entries = task.metadata.evidence.get_or_insert_with(Vec::new);
        for link in links {
            entries.push(EvidenceEntry {
                link: link.clone(),
                note: note.map(ToString::to_string),
                added_at: now.clone(),
            });
        }
        check_metadata_size(&task)?;

        tasks::update(&tx, &task, &now)?;
        let reason = match note {
            Some(note) => format!("appended {} evidence links ({note})", links.len()),
            None => format!("appended {} evidence links", links.len()),
        };
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::EvidenceBulkAdded,
                from_state: None,
                to_state: None,
                actor,
                reason: Some(&reason),
                created_at: &now,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(links.len())
    }

    /// Sets the `docsUpdated` flag.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] on store failure or missing task.
    pub fn docs_updated(
        &self,
        actor: &str,
        task_id: &str,
        value: bool,
    ) -> Result<(), GovernanceError> {
        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let mut task =
            tasks::get(&tx, task_id)?.ok_or_else(|| GovernanceError::not_found("task", task_id))?;

        task.metadata.docs_updated = Some(value);
        let now = now_iso();
        tasks::update(&tx, &task, &now)?;
        let reason = format!("docsUpdated={value}");
        activities::append(
            &tx,
            &NewActivity {
                task_id,
                action: ActivityAction::DocsUpdatedSet,
                from_state: None,
                to_state: None,
                actor,
                reason: Some(&reason),
                created_at: &now,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------

    /// Creates a chat topic.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] for unknown groups or an
    /// empty title.
    pub fn create_topic(&self, group: &str, title: &str) -> Result<Topic, GovernanceError> {
        self.registry
            .require(group)
            .map_err(|e| GovernanceError::validation(e.to_string()))?;
        let title = title.trim();
        if title.is_empty() {
            return Err(GovernanceError::validation("title must not be empty"));
        }

        let now = now_iso();
        let topic = Topic {
            id: new_topic_id(),
            group_folder: group.to_string(),
            title: title.to_string(),
            status: "active".to_string(),
            created_at: now.clone(),
            last_activity: now,
        };
        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        chat::insert_topic(&tx, &topic)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(topic)
    }

    /// Writes a chat message row and publishes `chat:message`.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Validation`] for empty or oversized
    /// text and unknown topics.
    pub fn post_chat(
        &self,
        group: &str,
        sender: &str,
        text: &str,
        topic_id: Option<&str>,
    ) -> Result<i64, GovernanceError> {
        self.registry
            .require(group)
            .map_err(|e| GovernanceError::validation(e.to_string()))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(GovernanceError::validation("text must not be empty"));
        }
        if text.chars().count() > opsd_core::scrub::MAX_COMMENT_LEN {
            return Err(GovernanceError::validation(format!(
                "text exceeds {} characters",
                opsd_core::scrub::MAX_COMMENT_LEN
            )));
        }

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        if let Some(topic_id) = topic_id {
            if chat::get_topic(&tx, topic_id)?.is_none() {
                return Err(GovernanceError::not_found("topic", topic_id));
            }
        }
        let message = ChatMessage {
            id: 0,
            topic_id: topic_id.map(ToString::to_string),
            group_folder: group.to_string(),
            sender: normalize_actor(Some(sender)),
            text: text.to_string(),
            timestamp: now_iso(),
        };
        let id = chat::insert_message(&tx, &message)?;
        tx.commit().map_err(StoreError::from)?;

        self.bus.publish(BusEvent::ChatMessage {
            group_folder: group.to_string(),
            detail: serde_json::json!({ "message_id": id, "sender": message.sender }),
        });
        Ok(id)
    }

    // -----------------------------------------------------------------
    // Reads used by multiple surfaces
    // -----------------------------------------------------------------

    /// Fetches a task.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::NotFound`] for unknown ids.
    pub fn get_task(&self, task_id: &str) -> Result<Task, GovernanceError> {
        self.store
            .read(|conn| tasks::get(conn, task_id))?
            .ok_or_else(|| GovernanceError::not_found("task", task_id))
    }

    /// Lists a task's activities in order.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] on store failure or missing task.
    pub fn list_activities(&self, task_id: &str) -> Result<Vec<Activity>, GovernanceError> {
        let conn = self.store.lock()?;
        if tasks::get(&conn, task_id)?.is_none() {
            return Err(GovernanceError::not_found("task", task_id));
        }
        Ok(activities::list_for_task(&conn, task_id)?)
    }

    /// Sweeps terminal external-call rows older than `max_age_days`.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] on store failure.
    pub fn sweep_ext_calls(&self, max_age_days: i64) -> Result<usize, GovernanceError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(max_age_days))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.store.lock()?;
        let deleted = ext_calls::sweep_terminal(&conn, &cutoff)?;
        if deleted > 0 {
            info!(deleted, "swept stale external call records");
        }
        Ok(deleted)
    }

    /// Marks an ext call picked up / finished. Used by the executor
    /// callback surface.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] for unknown requests and illegal
    /// status successions.
    pub fn update_ext_call_status(
        &self,
        request_id: &str,
        status: ExtCallStatus,
        result_summary: Option<&str>,
        response_data: Option<&serde_json::Value>,
        duration_ms: Option<i64>,
    ) -> Result<(), GovernanceError> {
        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;
        let call = ext_calls::get(&tx, request_id)?
            .ok_or_else(|| GovernanceError::not_found("ext call", request_id))?;
        if !call.status.can_become(status) {
            return Err(GovernanceError::validation(format!(
                "status {} cannot become {}",
                call.status.as_str(),
                status.as_str()
            )));
        }

        let scrubbed = response_data
            .map(|data| {
                let mut data = data.clone();
                opsd_core::scrub::scrub_value(&mut data);
                serde_json::to_string(&data)
                    .map_err(|e| StoreError::corrupt(format!("response serialize: {e}")))
            })
            .transpose()?;

        ext_calls::update_status(
            &tx,
            request_id,
            status,
            result_summary,
            scrubbed.as_deref(),
            duration_ms,
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }
}

/// Maps a metadata-size overflow to a validation error (the caller sent
/// too much data) instead of surfacing it as an internal store failure.
fn check_metadata_size(task: &Task) -> Result<(), GovernanceError> {
    match task.metadata.to_storage() {
        Ok(_) => Ok(()),
        Err(err @ opsd_core::task::MetadataError::TooLarge { .. }) => {
            Err(GovernanceError::validation(err.to_string()))
        }
        Err(err) => Err(StoreError::corrupt(err.to_string()).into()),
    }
}

fn is_dod_id(id: &str) -> bool {
    id.strip_prefix("dod-").map_or(false, |rest| {
        !rest.is_empty()
            && rest
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    })
}

fn validate_evidence_link(link: &str) -> Result<(), GovernanceError> {
    if link.chars().count() > MAX_EVIDENCE_LINK_LEN {
        return Err(GovernanceError::validation(format!(
            "link exceeds {MAX_EVIDENCE_LINK_LEN} characters"
        )));
    }
    if !(link.starts_with("https://") || link.starts_with("http://")) {
        return Err(GovernanceError::validation(
            "link must be an http(s) URL".to_string(),
        ));
    }
    Ok(())
}

fn is_unique_violation(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(strict: bool) -> GovernanceEngine {
        GovernanceEngine::new(
            Store::open_in_memory().unwrap(),
            EventBus::default(),
            GroupRegistry::default(),
            strict,
        )
    }

    fn create_basic(engine: &GovernanceEngine) -> String {
        engine
            .create(
                MAIN,
                CreateTask {
                    title: "Basic task".to_string(),
                    task_type: TaskType::Feature,
                    ..Default::default()
                },
            )
            .unwrap()
            .task_id
    }

    #[test]
    fn test_create_requires_main() {
        let engine = engine(false);
        let err = engine
            .create(
                "developer",
                CreateTask {
                    title: "nope".to_string(),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Forbidden { .. }));
    }

    #[test]
    fn test_create_title_bounds() {
        let engine = engine(false);
        let exact = engine.create(
            MAIN,
            CreateTask {
                title: "x".repeat(MAX_TITLE_LEN),
                ..Default::default()
            },
        );
        assert!(exact.is_ok());

        let over = engine.create(
            MAIN,
            CreateTask {
                title: "x".repeat(MAX_TITLE_LEN + 1),
                ..Default::default()
            },
        );
        let err = over.unwrap_err();
        assert!(err.to_string().contains("title"));
        assert!(err.to_string().contains("140"));
    }

    #[test]
    fn test_create_applies_type_template() {
        let engine = engine(false);
        let id = engine
            .create(
                MAIN,
                CreateTask {
                    title: "Security sweep".to_string(),
                    task_type: TaskType::Security,
                    ..Default::default()
                },
            )
            .unwrap()
            .task_id;
        let task = engine.get_task(&id).unwrap();
        assert_eq!(task.gate, Gate::Security);
        assert_eq!(task.assigned_group, "security");
        assert!(task.metadata.dod_checklist.is_some());
        assert_eq!(
            task.metadata.policy_version.as_deref(),
            Some(opsd_core::policy::POLICY_VERSION)
        );
    }

    #[test]
    fn test_create_explicit_fields_beat_template() {
        let engine = engine(false);
        let id = engine
            .create(
                MAIN,
                CreateTask {
                    title: "Custom".to_string(),
                    task_type: TaskType::Security,
                    gate: Some(Gate::None),
                    assigned_group: Some("developer".to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .task_id;
        let task = engine.get_task(&id).unwrap();
        assert_eq!(task.gate, Gate::None);
        assert_eq!(task.assigned_group, "developer");
    }

    #[test]
    fn test_company_with_product_rejected() {
        let engine = engine(false);
        let err = engine
            .create(
                MAIN,
                CreateTask {
                    title: "bad scope".to_string(),
                    scope: Some(Scope::Company),
                    product_id: Some("site".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)));
    }

    #[test]
    fn test_scope_coercion_logs_system_activity() {
        let engine = engine(false);
        let id = engine
            .create(
                MAIN,
                CreateTask {
                    title: "orphan product task".to_string(),
                    scope: Some(Scope::Product),
                    ..Default::default()
                },
            )
            .unwrap()
            .task_id;

        let task = engine.get_task(&id).unwrap();
        assert_eq!(task.scope, Scope::Company);
        assert_eq!(task.product_id, None);

        let acts = engine.list_activities(&id).unwrap();
        let coerce = acts
            .iter()
            .find(|a| a.action == ActivityAction::CoerceScope)
            .expect("coerce_scope activity");
        assert_eq!(coerce.actor, SYSTEM_ACTOR);
        assert_eq!(coerce.reason.as_deref(), Some(COERCE_SCOPE_REASON));
    }

    #[test]
    fn test_transition_authorization() {
        let engine = engine(false);
        let id = create_basic(&engine);
        // Assigned group is developer (template); security may not move it.
        let err = engine
            .transition("security", &id, TaskState::Triaged, None, None)
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Forbidden { .. }));
        // The assigned group itself may.
        engine
            .transition("developer", &id, TaskState::Triaged, None, None)
            .unwrap();
    }

    #[test]
    fn test_same_state_is_silent_no_op() {
        let engine = engine(false);
        let id = create_basic(&engine);
        let before = engine.get_task(&id).unwrap();
        let out = engine
            .transition(MAIN, &id, TaskState::Inbox, None, None)
            .unwrap();
        assert!(out.no_op);
        let after = engine.get_task(&id).unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(engine.list_activities(&id).unwrap().len(), 1); // create only
    }

    #[test]
    fn test_stale_version_rejected_without_write() {
        let engine = engine(false);
        let id = create_basic(&engine);
        engine
            .transition(MAIN, &id, TaskState::Triaged, None, Some(1))
            .unwrap();
        let err = engine
            .transition(MAIN, &id, TaskState::Ready, None, Some(1))
            .unwrap_err();
        assert!(matches!(err, GovernanceError::StaleVersion { found: 2, .. }));
        assert_eq!(engine.get_task(&id).unwrap().state, TaskState::Triaged);
    }

    #[test]
    fn test_strict_review_needs_summary_and_logs_it() {
        let engine = engine(true);
        let id = create_basic(&engine);
        // Prepare metadata so strict DOING entry passes.
        engine
            .dod_update(
                MAIN,
                &id,
                vec![DodItemInput {
                    id: None,
                    text: "implement the feature".to_string(),
                    done: false,
                }],
            )
            .unwrap();
        {
            // evidenceRequired must be declared before DOING.
            let mut guard = engine.store().lock().unwrap();
            let tx = guard.transaction().unwrap();
            let mut task = tasks::get(&tx, &id).unwrap().unwrap();
            task.metadata.evidence_required = Some(false);
            tasks::update(&tx, &task, &now_iso()).unwrap();
            tx.commit().unwrap();
        }

        for to in [TaskState::Triaged, TaskState::Ready, TaskState::Doing] {
            engine.transition(MAIN, &id, to, None, None).unwrap();
        }

        let err = engine
            .transition(MAIN, &id, TaskState::Review, Some("  "), None)
            .unwrap_err();
        assert!(matches!(err, GovernanceError::PolicyDenied { .. }));

        engine
            .transition(MAIN, &id, TaskState::Review, Some("Done implementing"), None)
            .unwrap();
        let acts = engine.list_activities(&id).unwrap();
        let summary = acts
            .iter()
            .find(|a| a.action == ActivityAction::ExecutionSummary)
            .expect("execution_summary activity");
        assert_eq!(summary.reason.as_deref(), Some("Done implementing"));
    }

    #[test]
    fn test_approve_upsert_keeps_one_row_two_activities() {
        let engine = engine(false);
        let id = create_basic(&engine);
        engine
            .approve("security", &id, Gate::Security, Some("lgtm"), None)
            .unwrap();
        engine
            .approve("security", &id, Gate::Security, Some("still lgtm"), None)
            .unwrap();

        let conn = engine.store().lock().unwrap();
        let rows = approvals::list_for_task(&conn, &id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notes.as_deref(), Some("still lgtm"));
        assert_eq!(
            activities::count_action(&conn, &id, ActivityAction::Approve).unwrap(),
            2
        );
    }

    #[test]
    fn test_separation_of_powers() {
        let engine = engine(false);
        let id = create_basic(&engine);
        engine
            .assign(MAIN, &id, "developer", Some("security"))
            .unwrap();

        let err = engine
            .approve("security", &id, Gate::Security, None, None)
            .unwrap_err();
        let GovernanceError::Forbidden { reason } = &err else {
            panic!("expected Forbidden, got {err:?}");
        };
        assert_eq!(reason, "FORBIDDEN_executor");

        // main is exempt unless main itself executes.
        engine.approve(MAIN, &id, Gate::Security, None, None).unwrap();
    }

    #[test]
    fn test_override_on_approval_completes() {
        let engine = engine(false);
        let id = create_basic(&engine);
        for to in [
            TaskState::Triaged,
            TaskState::Ready,
            TaskState::Doing,
            TaskState::Review,
            TaskState::Approval,
        ] {
            engine.transition(MAIN, &id, to, Some("step"), None).unwrap();
        }

        let state = engine
            .override_gate(
                MAIN,
                &id,
                "launch window",
                "gate skipped for 7 days",
                "2026-08-09T00:00:00.000Z",
            )
            .unwrap();
        assert_eq!(state, TaskState::Done);

        let acts = engine.list_activities(&id).unwrap();
        assert!(acts.iter().any(|a| a.action == ActivityAction::Override));
        let transitions: Vec<_> = acts
            .iter()
            .filter(|a| a.action == ActivityAction::Transition)
            .collect();
        assert_eq!(transitions.last().unwrap().to_state, Some(TaskState::Done));
    }

    #[test]
    fn test_comment_mentions_fan_out() {
        let engine = engine(false);
        let id = create_basic(&engine);
        let out = engine
            .comment(None, &id, "cc @developer and @security please review")
            .unwrap();
        assert_eq!(out.mentions, vec!["developer", "security"]);
        assert_eq!(out.notification_ids.len(), 2);

        let conn = engine.store().lock().unwrap();
        let dev = notifications::list(&conn, "developer", true, 10).unwrap();
        assert_eq!(dev.len(), 1);
        assert!(dev[0].snippet.starts_with("cc @developer"));
        assert_eq!(dev[0].actor, "cockpit");
    }

    #[test]
    fn test_mark_read_bounds() {
        let engine = engine(false);
        assert!(engine.mark_notifications_read(&[]).is_err());
        let too_many: Vec<i64> = (0..=(MAX_MARK_READ_IDS as i64)).collect();
        let err = engine.mark_notifications_read(&too_many).unwrap_err();
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn test_dod_update_is_idempotent_over_triples() {
        let engine = engine(false);
        let id = create_basic(&engine);
        engine
            .dod_update(
                MAIN,
                &id,
                vec![
                    DodItemInput {
                        id: Some("dod-alpha1".to_string()),
                        text: "write tests".to_string(),
                        done: true,
                    },
                    DodItemInput {
                        id: Some("not-a-dod-id".to_string()),
                        text: "update docs".to_string(),
                        done: false,
                    },
                ],
            )
            .unwrap();

        let task = engine.get_task(&id).unwrap();
        let status = task.metadata.dod_status.clone().unwrap();
        assert_eq!(status[0].id, "dod-alpha1");
        assert!(status[1].id.starts_with("dod-"));
        assert_ne!(status[1].id, "not-a-dod-id");

        // Re-apply the same triples: same content, two equal hashes.
        let replay: Vec<DodItemInput> = status
            .iter()
            .map(|i| DodItemInput {
                id: Some(i.id.clone()),
                text: i.text.clone(),
                done: i.done,
            })
            .collect();
        engine.dod_update(MAIN, &id, replay).unwrap();

        let after = engine.get_task(&id).unwrap();
        assert_eq!(after.metadata.dod_status, Some(status));

        let acts = engine.list_activities(&id).unwrap();
        let reasons: Vec<_> = acts
            .iter()
            .filter(|a| a.action == ActivityAction::DodUpdated)
            .map(|a| a.reason.clone().unwrap())
            .collect();
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons[0], reasons[1]);
        assert!(reasons[0].starts_with("1/2 h:"));
    }

    #[test]
    fn test_evidence_bounds_and_bulk_reason_has_no_urls() {
        let engine = engine(false);
        let id = create_basic(&engine);

        let long = format!("https://example.com/{}", "x".repeat(MAX_EVIDENCE_LINK_LEN));
        assert!(engine.evidence(MAIN, &id, &long, None).is_err());

        let links = vec![
            "https://ci.example/run/1".to_string(),
            "https://ci.example/run/2".to_string(),
        ];
        let appended = engine
            .evidence_bulk(MAIN, &id, &links, Some("ci runs"))
            .unwrap();
        assert_eq!(appended, 2);

        let task = engine.get_task(&id).unwrap();
        let evidence = task.metadata.evidence.unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].added_at, evidence[1].added_at);

        let acts = engine.list_activities(&id).unwrap();
        let bulk = acts
            .iter()
            .find(|a| a.action == ActivityAction::EvidenceBulkAdded)
            .unwrap();
        let reason = bulk.reason.as_deref().unwrap();
        assert!(!reason.contains("https://"));
        assert!(reason.contains('2'));
    }

    #[test]
    fn test_version_arithmetic() {
        let engine = engine(false);
        let id = create_basic(&engine);
        assert_eq!(engine.get_task(&id).unwrap().version, 1);

        engine
            .transition(MAIN, &id, TaskState::Triaged, None, None)
            .unwrap();
        engine.comment(None, &id, "a note").unwrap();
        engine.docs_updated(MAIN, &id, true).unwrap();
        engine
            .approve("security", &id, Gate::Security, None, None)
            .unwrap();

        assert_eq!(engine.get_task(&id).unwrap().version, 5);
    }

    #[test]
    fn test_exactly_one_create_activity() {
        let engine = engine(false);
        let id = create_basic(&engine);
        engine
            .transition(MAIN, &id, TaskState::Triaged, None, None)
            .unwrap();
        let conn = engine.store().lock().unwrap();
        assert_eq!(
            activities::count_action(&conn, &id, ActivityAction::Create).unwrap(),
            1
        );
    }

    #[test]
    fn test_topic_and_chat() {
        let engine = engine(false);
        let topic = engine.create_topic("main", "launch planning").unwrap();
        assert!(topic.id.starts_with("topic-"));

        let id = engine
            .post_chat("main", "cockpit", "kickoff at noon", Some(&topic.id))
            .unwrap();
        assert!(id > 0);

        assert!(engine.post_chat("main", "cockpit", "   ", None).is_err());
        assert!(engine
            .post_chat("main", "cockpit", "hello", Some("topic-missing"))
            .is_err());
    }
}
