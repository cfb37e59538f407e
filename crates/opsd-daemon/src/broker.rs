//! External-access broker.
//!
//! Every outbound provider call is brokered here before an executor may
//! touch the network. Authorization is fail-closed and evaluated in a
//! fixed order - the first failing step wins:
//!
//! 1. capability lookup (active, unexpired) for `(group, provider)`
//! 2. deny list (wins over everything)
//! 3. allow list (when non-empty)
//! 4. access-level envelope for the action
//! 5. task binding: the call must reference a governed task in
//!    `DOING`/`APPROVAL` assigned to the calling group (`main` exempt
//!    from the group match)
//! 6. backpressure, provider rate limit, and daily quota
//! 7. idempotency replay: a prior `executed` call with the same
//!    `(key, provider, action)` answers without side effect
//!
//! Policy denials (steps 1-5) are themselves recorded as `denied` call
//! rows so the audit trail shows what was attempted. Capacity rejections
//! (step 6) are transient and return without a row. Raw parameter values
//! are never stored: the row carries an HMAC over the canonical JSON and
//! a type/length summary.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use opsd_core::canonical::canonical_json;
use opsd_core::capability::{check_action, AccessLevel, ExtCall, ExtCallStatus};
use opsd_core::digest::hmac_hex;
use opsd_core::group::MAIN;
use opsd_core::id::{new_request_id, now_iso};
use opsd_core::scrub::summarize_params;
use opsd_core::task::TaskState;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::store::{capabilities, ext_calls, tasks, Store, StoreError};

/// Broker tuning, split from [`Config`] so tests can construct it
/// directly.
#[derive(Debug, Clone)]
pub struct BrokerLimits {
    /// Max pending (`authorized`/`processing`) calls per group.
    pub backpressure_limit: i64,
    /// Max calls per provider within the rate window.
    pub rate_limit_max: u32,
    /// Sliding rate window.
    pub rate_limit_window: Duration,
    /// Max non-denied calls per `(group, provider)` per UTC day.
    pub daily_quota: i64,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            backpressure_limit: 10,
            rate_limit_max: 60,
            rate_limit_window: Duration::from_secs(60),
            daily_quota: 500,
        }
    }
}

/// A brokered call request.
#[derive(Debug, Clone)]
pub struct ExtCallRequest {
    /// Calling group.
    pub group_folder: String,
    /// Target provider.
    pub provider: String,
    /// Requested action.
    pub action: String,
    /// Call parameters; hashed and summarized, never stored raw.
    pub params: serde_json::Value,
    /// Governed task the call is bound to.
    pub task_id: Option<String>,
    /// Client idempotency key.
    pub idempotency_key: Option<String>,
}

/// Successful broker outcome.
#[derive(Debug, Clone)]
pub enum BrokerOutcome {
    /// A fresh call was authorized and recorded; the executor takes over.
    Authorized {
        /// The new call's request id.
        request_id: String,
    },
    /// An idempotent replay: the prior executed call answers.
    Replayed {
        /// The prior call's request id.
        request_id: String,
        /// The prior call's scrubbed response payload.
        response_data: Option<String>,
    },
}

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Policy denial; recorded as a `denied` call row.
    #[error("{code}: {message}")]
    Denied {
        /// Machine-readable denial code.
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },

    /// Transient capacity rejection; retriable after backoff.
    #[error("{code}: {message}")]
    Capacity {
        /// Machine-readable code (`BACKPRESSURE`, `RATE_LIMITED`,
        /// `QUOTA_EXCEEDED`).
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },

    /// Request shape failure (bad params, oversized, unhashable).
    #[error("{0}")]
    Validation(String),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The broker.
pub struct ExtBroker {
    store: Store,
    hmac_secret: SecretString,
    limits: BrokerLimits,
    /// Per-provider timestamps for the sliding rate window.
    rate_state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ExtBroker {
    /// Creates a broker over the store with the given limits.
    #[must_use]
    pub fn new(store: Store, hmac_secret: SecretString, limits: BrokerLimits) -> Self {
        Self {
            store,
            hmac_secret,
            limits,
            rate_state: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a broker from daemon configuration.
    #[must_use]
    pub fn from_config(store: Store, config: &Config) -> Self {
        Self::new(
            store,
            SecretString::from(config.ext_call_hmac_secret.expose_secret().to_string()),
            BrokerLimits {
                backpressure_limit: config.ext_backpressure_limit,
                rate_limit_max: config.ext_rate_limit_max,
                rate_limit_window: config.ext_rate_limit_window,
                daily_quota: config.ext_daily_quota,
            },
        )
    }

    /// Authorizes and records a call, or replays a prior idempotent one.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Denied`] for policy denials (also recorded
    /// as audit rows), [`BrokerError::Capacity`] for transient limits,
    /// and [`BrokerError::Validation`] for malformed requests.
    pub fn authorize(&self, request: &ExtCallRequest) -> Result<BrokerOutcome, BrokerError> {
        let now = now_iso();
        let canonical = canonical_json(&request.params)
            .map_err(|e| BrokerError::Validation(format!("params: {e}")))?;
        let params_hmac = hmac_hex(self.hmac_secret.expose_secret(), &canonical);
        let params_summary = summarize_params(&request.params);

        let mut guard = self.store.lock()?;
        let tx = guard.transaction().map_err(StoreError::from)?;

        // 1. Capability lookup.
        let cap = capabilities::get(&tx, &request.group_folder, &request.provider)?;
        let cap = match cap {
            Some(cap) if cap.active && !cap.is_expired(&now) => cap,
            _ => {
                return self.deny(
                    tx,
                    request,
                    &params_hmac,
                    &params_summary,
                    None,
                    None,
                    "NO_CAPABILITY",
                    format!(
                        "no active capability for {} on {}",
                        request.group_folder, request.provider
                    ),
                    &now,
                );
            }
        };

        // 2-4. Deny-wins, allow list, level envelope.
        if let Some(denial) = check_action(&cap, &request.action) {
            return self.deny(
                tx,
                request,
                &params_hmac,
                &params_summary,
                None,
                Some(cap.access_level),
                denial.as_str(),
                format!("action {} refused", request.action),
                &now,
            );
        }

        // 5. Task binding.
        let Some(task_id) = request.task_id.as_deref().filter(|t| !t.is_empty()) else {
            return self.deny(
                tx,
                request,
                &params_hmac,
                &params_summary,
                None,
                Some(cap.access_level),
                "TASK_REQUIRED",
                "external calls must reference a governed task".to_string(),
                &now,
            );
        };
        let Some(task) = tasks::get(&tx, task_id)? else {
            return self.deny(
                tx,
                request,
                &params_hmac,
                &params_summary,
                None,
                Some(cap.access_level),
                "TASK_NOT_FOUND",
                format!("task {task_id} does not exist"),
                &now,
            );
        };
        if !matches!(task.state, TaskState::Doing | TaskState::Approval) {
            return self.deny(
                tx,
                request,
                &params_hmac,
                &params_summary,
                Some(&task.id),
                Some(cap.access_level),
                "TASK_NOT_ACTIVE",
                format!("task {task_id} is in {}, not DOING/APPROVAL", task.state),
                &now,
            );
        }
        if request.group_folder != MAIN && task.assigned_group != request.group_folder {
            return self.deny(
                tx,
                request,
                &params_hmac,
                &params_summary,
                Some(&task.id),
                Some(cap.access_level),
                "TASK_GROUP_MISMATCH",
                format!(
                    "task {task_id} is assigned to {}, not {}",
                    task.assigned_group, request.group_folder
                ),
                &now,
            );
        }

        // 6. Backpressure, then the per-provider rate and quota caps.
        let pending = ext_calls::pending_count(&tx, &request.group_folder)?;
        if pending >= self.limits.backpressure_limit {
            return Err(BrokerError::Capacity {
                code: "BACKPRESSURE",
                message: format!(
                    "{pending} pending calls for {} (limit {})",
                    request.group_folder, self.limits.backpressure_limit
                ),
            });
        }
        self.check_rate(&request.provider)?;
        let day_start = format!("{}T00:00:00.000Z", &now[..10]);
        let today = ext_calls::count_since(&tx, &request.group_folder, &request.provider, &day_start)?;
        if today >= self.limits.daily_quota {
            return Err(BrokerError::Capacity {
                code: "QUOTA_EXCEEDED",
                message: format!(
                    "daily quota of {} reached for {} on {}",
                    self.limits.daily_quota, request.group_folder, request.provider
                ),
            });
        }

        // 7. Idempotency replay.
        if let Some(key) = request.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            if let Some(prior) =
                ext_calls::find_executed_by_key(&tx, key, &request.provider, &request.action)?
            {
                info!(
                    request_id = %prior.request_id,
                    provider = %request.provider,
                    "idempotent replay of executed call"
                );
                return Ok(BrokerOutcome::Replayed {
                    request_id: prior.request_id,
                    response_data: prior.response_data,
                });
            }
        }

        let call = ExtCall {
            request_id: new_request_id(),
            group_folder: request.group_folder.clone(),
            provider: request.provider.clone(),
            action: request.action.clone(),
            access_level: cap.access_level,
            params_hmac,
            params_summary,
            status: ExtCallStatus::Authorized,
            denial_reason: None,
            result_summary: None,
            response_data: None,
            task_id: Some(task.id.clone()),
            product_id: task.product_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            duration_ms: None,
            created_at: now,
        };
        ext_calls::insert(&tx, &call)?;
        tx.commit().map_err(StoreError::from)?;

        info!(
            request_id = %call.request_id,
            group = %call.group_folder,
            provider = %call.provider,
            action = %call.action,
            "external call authorized"
        );
        Ok(BrokerOutcome::Authorized {
            request_id: call.request_id,
        })
    }

    /// Records a denial row, commits it, and returns the matching error.
    ///
    /// Denials are audit events in their own right; the transaction is
    /// committed here so the early error return cannot roll the row back.
    #[allow(clippy::too_many_arguments)]
    fn deny(
        &self,
        tx: rusqlite::Transaction<'_>,
        request: &ExtCallRequest,
        params_hmac: &str,
        params_summary: &str,
        task_id: Option<&str>,
        level: Option<AccessLevel>,
        code: &'static str,
        message: String,
        now: &str,
    ) -> Result<BrokerOutcome, BrokerError> {
        let call = ExtCall {
            request_id: new_request_id(),
            group_folder: request.group_folder.clone(),
            provider: request.provider.clone(),
            action: request.action.clone(),
            access_level: level.unwrap_or(AccessLevel::L0),
            params_hmac: params_hmac.to_string(),
            params_summary: params_summary.to_string(),
            status: ExtCallStatus::Denied,
            denial_reason: Some(code.to_string()),
            result_summary: None,
            response_data: None,
            task_id: task_id.map(ToString::to_string),
            product_id: None,
            idempotency_key: request.idempotency_key.clone(),
            duration_ms: None,
            created_at: now.to_string(),
        };
        ext_calls::insert(&tx, &call)?;
        tx.commit().map_err(StoreError::from)?;
        warn!(
            group = %request.group_folder,
            provider = %request.provider,
            action = %request.action,
            code,
            "external call denied"
        );
        Err(BrokerError::Denied { code, message })
    }

    fn check_rate(&self, provider: &str) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self
            .rate_state
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let window = state.entry(provider.to_string()).or_default();
        let cutoff = now.checked_sub(self.limits.rate_limit_window).unwrap_or(now);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        if window.len() >= self.limits.rate_limit_max as usize {
            return Err(BrokerError::Capacity {
                code: "RATE_LIMITED",
                message: format!(
                    "provider {provider} exceeded {} calls per {:?}",
                    self.limits.rate_limit_max, self.limits.rate_limit_window
                ),
            });
        }
        window.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use opsd_core::capability::Capability;
    use opsd_core::task::{
        Gate, Priority, Scope, Task, TaskMetadata, TaskType,
    };

    use super::*;

    fn seed_task(store: &Store, id: &str, state: TaskState, group: &str) {
        let conn = store.lock().unwrap();
        let now = now_iso();
        tasks::insert(
            &conn,
            &Task {
                id: id.to_string(),
                title: "t".to_string(),
                description: None,
                task_type: TaskType::Feature,
                state,
                priority: Priority::P2,
                scope: Scope::Company,
                product_id: None,
                assigned_group: group.to_string(),
                executor: None,
                created_by: "main".to_string(),
                gate: Gate::None,
                dod_required: false,
                metadata: TaskMetadata::default(),
                version: 1,
                created_at: now.clone(),
                updated_at: now,
            },
        )
        .unwrap();
    }

    fn grant(store: &Store, group: &str, level: AccessLevel, denied: &[&str]) {
        let conn = store.lock().unwrap();
        capabilities::upsert(
            &conn,
            &Capability {
                group_folder: group.to_string(),
                provider: "github".to_string(),
                access_level: level,
                allowed_actions: Vec::new(),
                denied_actions: denied.iter().map(|s| (*s).to_string()).collect(),
                granted_by: "main".to_string(),
                granted_at: now_iso(),
                expires_at: Some("2030-01-01T00:00:00.000Z".to_string()),
                active: true,
            },
        )
        .unwrap();
    }

    fn broker(store: &Store) -> ExtBroker {
        ExtBroker::new(
            store.clone(),
            SecretString::from("hmac-secret-for-tests"),
            BrokerLimits::default(),
        )
    }

    fn request(group: &str, task_id: &str) -> ExtCallRequest {
        ExtCallRequest {
            group_folder: group.to_string(),
            provider: "github".to_string(),
            action: "create_issue".to_string(),
            params: serde_json::json!({"title": "hello", "repo": "acme/site"}),
            task_id: Some(task_id.to_string()),
            idempotency_key: None,
        }
    }

    const TASK: &str = "gov-20260802T090000Z-abc123";

    #[test]
    fn test_no_capability_denied_and_recorded() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        let broker = broker(&store);

        let err = broker.authorize(&request("developer", TASK)).unwrap_err();
        let BrokerError::Denied { code, .. } = err else {
            panic!("expected denial");
        };
        assert_eq!(code, "NO_CAPABILITY");

        let conn = store.lock().unwrap();
        let calls = ext_calls::list(&conn, Some("developer"), 10).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ExtCallStatus::Denied);
        assert_eq!(calls[0].denial_reason.as_deref(), Some("NO_CAPABILITY"));
    }

    #[test]
    fn test_deny_wins() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        grant(&store, "developer", AccessLevel::L3, &["create_issue"]);
        let broker = broker(&store);

        let err = broker.authorize(&request("developer", TASK)).unwrap_err();
        let BrokerError::Denied { code, .. } = err else {
            panic!("expected denial");
        };
        assert_eq!(code, "DENIED_BY_POLICY");
    }

    #[test]
    fn test_task_binding_rules() {
        let store = Store::open_in_memory().unwrap();
        grant(&store, "developer", AccessLevel::L2, &[]);
        grant(&store, MAIN, AccessLevel::L2, &[]);
        let broker = broker(&store);

        // Missing task.
        let mut req = request("developer", TASK);
        req.task_id = None;
        let BrokerError::Denied { code, .. } = broker.authorize(&req).unwrap_err() else {
            panic!()
        };
        assert_eq!(code, "TASK_REQUIRED");

        // Unknown task.
        let BrokerError::Denied { code, .. } =
            broker.authorize(&request("developer", TASK)).unwrap_err()
        else {
            panic!()
        };
        assert_eq!(code, "TASK_NOT_FOUND");

        // Wrong state.
        seed_task(&store, TASK, TaskState::Inbox, "developer");
        let BrokerError::Denied { code, .. } =
            broker.authorize(&request("developer", TASK)).unwrap_err()
        else {
            panic!()
        };
        assert_eq!(code, "TASK_NOT_ACTIVE");

        // Wrong group - and the main override for it.
        let active = "gov-20260802T090001Z-def456";
        seed_task(&store, active, TaskState::Doing, "security");
        let BrokerError::Denied { code, .. } =
            broker.authorize(&request("developer", active)).unwrap_err()
        else {
            panic!()
        };
        assert_eq!(code, "TASK_GROUP_MISMATCH");
        assert!(broker.authorize(&request(MAIN, active)).is_ok());
    }

    #[test]
    fn test_backpressure() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        grant(&store, "developer", AccessLevel::L2, &[]);
        let broker = ExtBroker::new(
            store.clone(),
            SecretString::from("hmac-secret-for-tests"),
            BrokerLimits {
                backpressure_limit: 2,
                ..Default::default()
            },
        );

        broker.authorize(&request("developer", TASK)).unwrap();
        broker.authorize(&request("developer", TASK)).unwrap();
        let err = broker.authorize(&request("developer", TASK)).unwrap_err();
        let BrokerError::Capacity { code, .. } = err else {
            panic!("expected capacity rejection");
        };
        assert_eq!(code, "BACKPRESSURE");

        // Capacity rejections leave no audit row.
        let conn = store.lock().unwrap();
        assert_eq!(ext_calls::list(&conn, Some("developer"), 10).unwrap().len(), 2);
    }

    #[test]
    fn test_idempotent_replay() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        grant(&store, "developer", AccessLevel::L2, &[]);
        let broker = broker(&store);

        let mut req = request("developer", TASK);
        req.idempotency_key = Some("idem-42".to_string());
        let BrokerOutcome::Authorized { request_id } = broker.authorize(&req).unwrap() else {
            panic!("expected fresh authorization");
        };

        // Executor completes the call.
        {
            let conn = store.lock().unwrap();
            ext_calls::update_status(
                &conn,
                &request_id,
                ExtCallStatus::Executed,
                Some("issue created"),
                Some(r#"{"issue":42}"#),
                Some(900),
            )
            .unwrap();
        }

        // Same key replays the stored response without a new row.
        let BrokerOutcome::Replayed {
            request_id: replayed,
            response_data,
        } = broker.authorize(&req).unwrap()
        else {
            panic!("expected replay");
        };
        assert_eq!(replayed, request_id);
        assert_eq!(response_data.as_deref(), Some(r#"{"issue":42}"#));

        let conn = store.lock().unwrap();
        let executed: Vec<_> = ext_calls::list(&conn, Some("developer"), 10)
            .unwrap()
            .into_iter()
            .filter(|c| c.status == ExtCallStatus::Executed)
            .collect();
        assert_eq!(executed.len(), 1);
    }

    #[test]
    fn test_same_key_different_provider_is_fresh() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        grant(&store, "developer", AccessLevel::L2, &[]);
        {
            let conn = store.lock().unwrap();
            capabilities::upsert(
                &conn,
                &Capability {
                    group_folder: "developer".to_string(),
                    provider: "linear".to_string(),
                    access_level: AccessLevel::L2,
                    allowed_actions: Vec::new(),
                    denied_actions: Vec::new(),
                    granted_by: "main".to_string(),
                    granted_at: now_iso(),
                    expires_at: Some("2030-01-01T00:00:00.000Z".to_string()),
                    active: true,
                },
            )
            .unwrap();
        }
        let broker = broker(&store);

        let mut req = request("developer", TASK);
        req.idempotency_key = Some("idem-42".to_string());
        let BrokerOutcome::Authorized { request_id } = broker.authorize(&req).unwrap() else {
            panic!()
        };
        {
            let conn = store.lock().unwrap();
            ext_calls::update_status(
                &conn,
                &request_id,
                ExtCallStatus::Executed,
                None,
                Some(r#"{"ok":true}"#),
                None,
            )
            .unwrap();
        }

        req.provider = "linear".to_string();
        assert!(matches!(
            broker.authorize(&req).unwrap(),
            BrokerOutcome::Authorized { .. }
        ));
    }

    #[test]
    fn test_params_never_stored_raw() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        grant(&store, "developer", AccessLevel::L2, &[]);
        let broker = broker(&store);

        let mut req = request("developer", TASK);
        req.params = serde_json::json!({"title": "SENSITIVE-VALUE", "api_token": "tok-xyz"});
        broker.authorize(&req).unwrap();

        let conn = store.lock().unwrap();
        let call = &ext_calls::list(&conn, Some("developer"), 10).unwrap()[0];
        assert!(!call.params_summary.contains("SENSITIVE-VALUE"));
        assert!(!call.params_summary.contains("tok-xyz"));
        assert_eq!(call.params_hmac.len(), 64);
    }

    #[test]
    fn test_hmac_is_key_order_invariant() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, TASK, TaskState::Doing, "developer");
        grant(&store, "developer", AccessLevel::L2, &[]);
        let broker = broker(&store);

        let mut a = request("developer", TASK);
        a.params = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let mut b = request("developer", TASK);
        b.params = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        broker.authorize(&a).unwrap();
        broker.authorize(&b).unwrap();

        let conn = store.lock().unwrap();
        let calls = ext_calls::list(&conn, Some("developer"), 10).unwrap();
        assert_eq!(calls[0].params_hmac, calls[1].params_hmac);
    }
}
