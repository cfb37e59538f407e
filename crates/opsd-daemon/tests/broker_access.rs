//! External-access broker scenarios: capability precedence, task
//! binding, idempotency, and the executor status lifecycle.

mod common;

use opsd_core::capability::{AccessLevel, Capability, ExtCallStatus};
use opsd_core::group::MAIN;
use opsd_core::id::now_iso;
use opsd_core::task::{Gate, TaskState, TaskType};
use opsd_daemon::broker::{BrokerError, BrokerLimits, BrokerOutcome, ExtBroker, ExtCallRequest};
use opsd_daemon::engine::{CreateTask, GovernanceEngine};
use opsd_daemon::store::{capabilities, ext_calls};
use secrecy::SecretString;

use common::engine;

fn grant(
    engine: &GovernanceEngine,
    group: &str,
    provider: &str,
    level: AccessLevel,
    allowed: &[&str],
    denied: &[&str],
) {
    let conn = engine.store().lock().unwrap();
    capabilities::upsert(
        &conn,
        &Capability {
            group_folder: group.to_string(),
            provider: provider.to_string(),
            access_level: level,
            allowed_actions: allowed.iter().map(|s| (*s).to_string()).collect(),
            denied_actions: denied.iter().map(|s| (*s).to_string()).collect(),
            granted_by: MAIN.to_string(),
            granted_at: now_iso(),
            expires_at: Some("2030-01-01T00:00:00.000Z".to_string()),
            active: true,
        },
    )
    .unwrap();
}

/// Creates a task and walks it to DOING so broker task binding passes.
fn doing_task(engine: &GovernanceEngine) -> String {
    let id = engine
        .create(
            MAIN,
            CreateTask {
                title: "Brokered work".to_string(),
                task_type: TaskType::Feature,
                gate: Some(Gate::None),
                assigned_group: Some("developer".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
        .task_id;
    for to in [TaskState::Triaged, TaskState::Ready, TaskState::Doing] {
        engine.transition(MAIN, &id, to, None, None).unwrap();
    }
    id
}

fn broker_for(engine: &GovernanceEngine) -> ExtBroker {
    ExtBroker::new(
        engine.store().clone(),
        SecretString::from("test-hmac-secret"),
        BrokerLimits::default(),
    )
}

fn request(group: &str, task_id: &str, key: Option<&str>) -> ExtCallRequest {
    ExtCallRequest {
        group_folder: group.to_string(),
        provider: "github".to_string(),
        action: "create_issue".to_string(),
        params: serde_json::json!({"repo": "acme/site", "title": "tracking issue"}),
        task_id: Some(task_id.to_string()),
        idempotency_key: key.map(ToString::to_string),
    }
}

#[test]
fn idempotency_key_replays_executed_call() {
    let engine = engine(false);
    let task = doing_task(&engine);
    grant(&engine, "developer", "github", AccessLevel::L2, &[], &[]);
    grant(&engine, "developer", "linear", AccessLevel::L2, &[], &[]);
    let broker = broker_for(&engine);

    let req = request("developer", &task, Some("idem-001"));
    let BrokerOutcome::Authorized { request_id } = broker.authorize(&req).unwrap() else {
        panic!("first call should authorize fresh");
    };

    engine
        .update_ext_call_status(
            &request_id,
            ExtCallStatus::Executed,
            Some("issue #42 created"),
            Some(&serde_json::json!({"issue": 42})),
            Some(640),
        )
        .unwrap();

    // Same (key, provider, action): replay, no new executed row.
    let BrokerOutcome::Replayed {
        request_id: replayed,
        response_data,
    } = broker.authorize(&req).unwrap()
    else {
        panic!("second call should replay");
    };
    assert_eq!(replayed, request_id);
    assert_eq!(response_data.as_deref(), Some(r#"{"issue":42}"#));

    // Same key against a different provider executes separately.
    let mut other = req.clone();
    other.provider = "linear".to_string();
    let BrokerOutcome::Authorized { request_id: fresh } = broker.authorize(&other).unwrap()
    else {
        panic!("different provider should not replay");
    };
    assert_ne!(fresh, request_id);

    let conn = engine.store().lock().unwrap();
    let executed = ext_calls::list(&conn, Some("developer"), 50)
        .unwrap()
        .into_iter()
        .filter(|c| c.status == ExtCallStatus::Executed)
        .count();
    assert_eq!(executed, 1);
}

#[test]
fn deny_wins_over_allow_and_level() {
    let engine = engine(false);
    let task = doing_task(&engine);
    grant(
        &engine,
        "developer",
        "github",
        AccessLevel::L3,
        &["create_issue"],
        &["create_issue"],
    );
    let broker = broker_for(&engine);

    let err = broker
        .authorize(&request("developer", &task, None))
        .unwrap_err();
    let BrokerError::Denied { code, .. } = err else {
        panic!("expected policy denial");
    };
    assert_eq!(code, "DENIED_BY_POLICY");
}

#[test]
fn every_recorded_call_references_a_real_task() {
    let engine = engine(false);
    let task = doing_task(&engine);
    grant(&engine, "developer", "github", AccessLevel::L2, &[], &[]);
    let broker = broker_for(&engine);

    broker.authorize(&request("developer", &task, None)).unwrap();

    let conn = engine.store().lock().unwrap();
    for call in ext_calls::list(&conn, None, 50).unwrap() {
        if call.status != ExtCallStatus::Denied {
            let task_id = call.task_id.expect("authorized calls bind a task");
            assert!(opsd_daemon::store::tasks::get(&conn, &task_id)
                .unwrap()
                .is_some());
        }
    }
}

#[test]
fn executor_lifecycle_and_scrubbed_response() {
    let engine = engine(false);
    let task = doing_task(&engine);
    grant(&engine, "developer", "github", AccessLevel::L2, &[], &[]);
    let broker = broker_for(&engine);

    let BrokerOutcome::Authorized { request_id } = broker
        .authorize(&request("developer", &task, None))
        .unwrap()
    else {
        panic!()
    };

    engine
        .update_ext_call_status(&request_id, ExtCallStatus::Processing, None, None, None)
        .unwrap();
    // Executor reports back with a payload containing secret-like keys.
    engine
        .update_ext_call_status(
            &request_id,
            ExtCallStatus::Executed,
            Some("done"),
            Some(&serde_json::json!({"issue": 7, "api_token": "tok-leaky"})),
            Some(1200),
        )
        .unwrap();

    let conn = engine.store().lock().unwrap();
    let call = ext_calls::get(&conn, &request_id).unwrap().unwrap();
    assert_eq!(call.status, ExtCallStatus::Executed);
    assert_eq!(call.duration_ms, Some(1200));
    let response = call.response_data.unwrap();
    assert!(!response.contains("tok-leaky"));
    assert!(response.contains("[redacted]"));
    drop(conn);

    // Terminal calls cannot move again.
    assert!(engine
        .update_ext_call_status(&request_id, ExtCallStatus::Processing, None, None, None)
        .is_err());
}

#[test]
fn timeout_records_duration() {
    let engine = engine(false);
    let task = doing_task(&engine);
    grant(&engine, "developer", "github", AccessLevel::L2, &[], &[]);
    let broker = broker_for(&engine);

    let BrokerOutcome::Authorized { request_id } = broker
        .authorize(&request("developer", &task, None))
        .unwrap()
    else {
        panic!()
    };

    engine
        .update_ext_call_status(
            &request_id,
            ExtCallStatus::Timeout,
            Some("provider deadline elapsed"),
            None,
            Some(30_000),
        )
        .unwrap();

    let conn = engine.store().lock().unwrap();
    let call = ext_calls::get(&conn, &request_id).unwrap().unwrap();
    assert_eq!(call.status, ExtCallStatus::Timeout);
    assert_eq!(call.duration_ms, Some(30_000));
}

#[test]
fn approval_state_also_satisfies_task_binding() {
    let engine = engine(false);
    let id = engine
        .create(
            MAIN,
            CreateTask {
                title: "Approval-stage call".to_string(),
                gate: Some(Gate::None),
                assigned_group: Some("developer".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
        .task_id;
    for to in [
        TaskState::Triaged,
        TaskState::Ready,
        TaskState::Doing,
        TaskState::Review,
        TaskState::Approval,
    ] {
        engine.transition(MAIN, &id, to, Some("step"), None).unwrap();
    }
    grant(&engine, "developer", "github", AccessLevel::L2, &[], &[]);
    let broker = broker_for(&engine);
    assert!(broker.authorize(&request("developer", &id, None)).is_ok());
}

#[test]
fn expired_capability_denies() {
    let engine = engine(false);
    let task = doing_task(&engine);
    {
        let conn = engine.store().lock().unwrap();
        capabilities::upsert(
            &conn,
            &Capability {
                group_folder: "developer".to_string(),
                provider: "github".to_string(),
                access_level: AccessLevel::L2,
                allowed_actions: Vec::new(),
                denied_actions: Vec::new(),
                granted_by: MAIN.to_string(),
                granted_at: "2026-01-01T00:00:00.000Z".to_string(),
                expires_at: Some("2026-01-08T00:00:00.000Z".to_string()),
                active: true,
            },
        )
        .unwrap();
    }
    let broker = broker_for(&engine);
    let BrokerError::Denied { code, .. } = broker
        .authorize(&request("developer", &task, None))
        .unwrap_err()
    else {
        panic!()
    };
    assert_eq!(code, "NO_CAPABILITY");
}
