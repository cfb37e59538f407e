//! Request handlers: JSON validation, engine/broker calls, status
//! mapping.
//!
//! Validation messages deliberately name the failing field and the
//! violated bound ("title must be 1..140 characters") - the cockpit
//! surfaces them verbatim.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use opsd_core::capability::ExtCallStatus;
use opsd_core::group::MAIN;
use opsd_core::task::{Gate, Priority, Scope, TaskType};
use serde_json::{json, Map, Value};

use super::auth;
use super::error::ApiError;
use super::AppState;
use crate::broker::{BrokerOutcome, ExtCallRequest};
use crate::engine::{CreateTask, DodItemInput};
use crate::store::{chat, ext_calls, notifications, products, tasks};

type JsonMap = Map<String, Value>;

/// Default and maximum row counts for list endpoints.
const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

// ---------------------------------------------------------------------
// Body helpers
// ---------------------------------------------------------------------

fn parse_object(body: &Bytes) -> Result<JsonMap, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation("body must be a JSON object".to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::Validation(
            "body must be a JSON object".to_string(),
        )),
    }
}

fn require_str(map: &JsonMap, key: &str) -> Result<String, ApiError> {
    match map.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ApiError::Validation(format!("{key} must be a string"))),
        None => Err(ApiError::Validation(format!("missing field: {key}"))),
    }
}

fn optional_str(map: &JsonMap, key: &str) -> Result<Option<String>, ApiError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ApiError::Validation(format!("{key} must be a string"))),
    }
}

fn optional_bool(map: &JsonMap, key: &str) -> Result<Option<bool>, ApiError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ApiError::Validation(format!("{key} must be a boolean"))),
    }
}

fn optional_i64(map: &JsonMap, key: &str) -> Result<Option<i64>, ApiError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) if n.as_i64().is_some() => Ok(n.as_i64()),
        Some(_) => Err(ApiError::Validation(format!("{key} must be a number"))),
    }
}

fn optional_str_array(map: &JsonMap, key: &str) -> Result<Option<Vec<String>>, ApiError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    _ => {
                        return Err(ApiError::Validation(format!(
                            "{key} must be an array of strings"
                        )))
                    }
                }
            }
            Ok(Some(out))
        }
        Some(_) => Err(ApiError::Validation(format!("{key} must be an array"))),
    }
}

fn parse_enum<T: FromStr>(map: &JsonMap, key: &str) -> Result<Option<T>, ApiError>
where
    T::Err: std::fmt::Display,
{
    match optional_str(map, key)? {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ApiError::Validation(e.to_string())),
    }
}

fn actor_or_main(map: &JsonMap) -> Result<String, ApiError> {
    Ok(optional_str(map, "actor")?.unwrap_or_else(|| MAIN.to_string()))
}

fn query_limit(params: &HashMap<String, String>) -> Result<u32, ApiError> {
    match params.get("limit") {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .parse::<u32>()
            .map(|n| n.min(MAX_LIMIT))
            .map_err(|_| ApiError::Validation("limit must be a number".to_string())),
    }
}

// ---------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------

/// `GET /healthz` - auth-exempt liveness probe.
pub async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

// ---------------------------------------------------------------------
// Governance commands
// ---------------------------------------------------------------------

/// `POST /ops/actions/create`
pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let input = CreateTask {
        title: require_str(&map, "title")?,
        description: optional_str(&map, "description")?,
        task_type: parse_enum::<TaskType>(&map, "task_type")?.unwrap_or_default(),
        priority: parse_enum::<Priority>(&map, "priority")?,
        scope: parse_enum::<Scope>(&map, "scope")?,
        product_id: optional_str(&map, "product_id")?,
        assigned_group: optional_str(&map, "assigned_group")?,
        executor: optional_str(&map, "executor")?,
        gate: parse_enum::<Gate>(&map, "gate")?,
        dod_required: optional_bool(&map, "dod_required")?,
        dod_checklist: optional_str_array(&map, "dodChecklist")?,
    };
    let out = state.engine.create(&actor, input)?;
    Ok(Json(json!({
        "ok": true,
        "taskId": out.task_id,
        "state": out.state.as_str(),
    })))
}

/// `POST /ops/actions/transition`
pub async fn transition(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let to = require_str(&map, "to")?
        .parse()
        .map_err(|e: opsd_core::task::ParseEnumError| ApiError::Validation(e.to_string()))?;
    let reason = optional_str(&map, "reason")?;
    let expected_version = optional_i64(&map, "expectedVersion")?;

    let out = state
        .engine
        .transition(&actor, &task_id, to, reason.as_deref(), expected_version)?;
    Ok(Json(json!({
        "ok": true,
        "taskId": task_id,
        "state": out.state.as_str(),
        "version": out.version,
        "noOp": out.no_op,
    })))
}

/// `POST /ops/actions/assign`
pub async fn assign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let group = require_str(&map, "assigned_group")?;
    let executor = optional_str(&map, "executor")?;
    state
        .engine
        .assign(&actor, &task_id, &group, executor.as_deref())?;
    Ok(Json(json!({ "ok": true, "taskId": task_id })))
}

/// `POST /ops/actions/approve`
pub async fn approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let gate: Gate = require_str(&map, "gate_type")?
        .parse()
        .map_err(|e: opsd_core::task::ParseEnumError| ApiError::Validation(e.to_string()))?;
    let notes = optional_str(&map, "notes")?;
    let evidence_link = optional_str(&map, "evidenceLink")?;
    state.engine.approve(
        &actor,
        &task_id,
        gate,
        notes.as_deref(),
        evidence_link.as_deref(),
    )?;
    Ok(Json(json!({
        "ok": true,
        "taskId": task_id,
        "gate": gate.as_str(),
    })))
}

/// `POST /ops/actions/override`
pub async fn override_gate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let reason = require_str(&map, "reason")?;
    let accepted_risk = require_str(&map, "acceptedRisk")?;
    let review_deadline = require_str(&map, "reviewDeadlineIso")?;
    let state_after =
        state
            .engine
            .override_gate(&actor, &task_id, &reason, &accepted_risk, &review_deadline)?;
    Ok(Json(json!({
        "ok": true,
        "taskId": task_id,
        "state": state_after.as_str(),
    })))
}

/// `POST /ops/actions/comment`
pub async fn comment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let task_id = require_str(&map, "taskId")?;
    let text = require_str(&map, "text")?;
    let actor = optional_str(&map, "actor")?;
    let out = state.engine.comment(actor.as_deref(), &task_id, &text)?;
    Ok(Json(json!({
        "ok": true,
        "taskId": task_id,
        "mentions": out.mentions,
        "notificationIds": out.notification_ids,
    })))
}

/// `POST /ops/actions/dod`
pub async fn dod(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let Some(Value::Array(raw_items)) = map.get("items") else {
        return Err(ApiError::Validation("items must be an array".to_string()));
    };

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        let Value::Object(item) = raw else {
            return Err(ApiError::Validation(
                "each item must be a JSON object".to_string(),
            ));
        };
        items.push(DodItemInput {
            id: optional_str(item, "id")?,
            text: require_str(item, "text")?,
            done: optional_bool(item, "done")?.unwrap_or(false),
        });
    }
    state.engine.dod_update(&actor, &task_id, items)?;
    Ok(Json(json!({ "ok": true, "taskId": task_id })))
}

/// `POST /ops/actions/evidence`
pub async fn evidence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let link = require_str(&map, "link")?;
    let note = optional_str(&map, "note")?;
    let count = state
        .engine
        .evidence(&actor, &task_id, &link, note.as_deref())?;
    Ok(Json(json!({
        "ok": true,
        "taskId": task_id,
        "evidenceCount": count,
    })))
}

/// `POST /ops/actions/evidence/bulk`
pub async fn evidence_bulk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let links = optional_str_array(&map, "links")?
        .ok_or_else(|| ApiError::Validation("links must be a non-empty array".to_string()))?;
    let note = optional_str(&map, "note")?;
    let appended = state
        .engine
        .evidence_bulk(&actor, &task_id, &links, note.as_deref())?;
    Ok(Json(json!({
        "ok": true,
        "taskId": task_id,
        "evidenceCount": appended,
    })))
}

/// `POST /ops/actions/docsUpdated`
pub async fn docs_updated(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let actor = actor_or_main(&map)?;
    let task_id = require_str(&map, "taskId")?;
    let value = optional_bool(&map, "docsUpdated")?
        .ok_or_else(|| ApiError::Validation("docsUpdated must be a boolean".to_string()))?;
    state.engine.docs_updated(&actor, &task_id, value)?;
    Ok(Json(json!({ "ok": true, "taskId": task_id })))
}

/// `POST /ops/actions/notifications/markRead`
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let Some(Value::Array(raw_ids)) = map.get("ids") else {
        return Err(ApiError::Validation(
            "ids must be an array of numbers".to_string(),
        ));
    };
    let mut ids = Vec::with_capacity(raw_ids.len());
    for raw in raw_ids {
        match raw.as_i64() {
            Some(id) => ids.push(id),
            None => {
                return Err(ApiError::Validation(
                    "ids must be an array of numbers".to_string(),
                ))
            }
        }
    }
    let marked = state.engine.mark_notifications_read(&ids)?;
    Ok(Json(json!({ "ok": true, "markedCount": marked })))
}

/// `POST /ops/actions/chat`
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let group = require_str(&map, "group")?;
    let text = require_str(&map, "text")?;
    let sender = optional_str(&map, "sender")?.unwrap_or_else(|| "cockpit".to_string());
    let topic_id = optional_str(&map, "topic_id")?;
    let message_id = state
        .engine
        .post_chat(&group, &sender, &text, topic_id.as_deref())?;
    Ok(Json(json!({ "ok": true, "messageId": message_id })))
}

/// `POST /ops/actions/topic`
pub async fn topic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let group = require_str(&map, "group")?;
    let title = require_str(&map, "title")?;
    let topic = state.engine.create_topic(&group, &title)?;
    Ok(Json(json!({ "ok": true, "topicId": topic.id })))
}

// ---------------------------------------------------------------------
// Broker surface
// ---------------------------------------------------------------------

/// `POST /ops/ext/call` - authorize and record an external call.
pub async fn ext_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let request = ExtCallRequest {
        group_folder: require_str(&map, "group")?,
        provider: require_str(&map, "provider")?,
        action: require_str(&map, "action")?,
        params: map.get("params").cloned().unwrap_or_else(|| json!({})),
        task_id: optional_str(&map, "task_id")?,
        idempotency_key: optional_str(&map, "idempotency_key")?,
    };
    match state.broker.authorize(&request)? {
        BrokerOutcome::Authorized { request_id } => Ok(Json(json!({
            "ok": true,
            "requestId": request_id,
            "status": "authorized",
        }))),
        BrokerOutcome::Replayed {
            request_id,
            response_data,
        } => {
            let response: Value = response_data
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            Ok(Json(json!({
                "ok": true,
                "requestId": request_id,
                "status": "executed",
                "replayed": true,
                "responseData": response,
            })))
        }
    }
}

/// `POST /ops/ext/status` - executor callback.
pub async fn ext_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    auth::require_write(&state.config, &headers)?;
    let map = parse_object(&body)?;
    let request_id = require_str(&map, "request_id")?;
    let status = require_str(&map, "status")?;
    let status = ExtCallStatus::parse(&status).ok_or_else(|| {
        ApiError::Validation(
            "status must be one of processing, executed, failed, timeout".to_string(),
        )
    })?;
    let result_summary = optional_str(&map, "result_summary")?;
    let response_data = map.get("response_data").cloned();
    let duration_ms = optional_i64(&map, "duration_ms")?;
    state.engine.update_ext_call_status(
        &request_id,
        status,
        result_summary.as_deref(),
        response_data.as_ref(),
        duration_ms,
    )?;
    Ok(Json(json!({ "ok": true, "requestId": request_id })))
}

/// `GET /ops/ext/calls?group=&limit=`
pub async fn list_ext_calls(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let limit = query_limit(&params)?;
    let calls = state
        .engine
        .store()
        .read(|conn| ext_calls::list(conn, params.get("group").map(String::as_str), limit))
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({ "ok": true, "calls": calls })))
}

// ---------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------

/// `GET /ops/tasks/:id`
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let task = state.engine.get_task(&id)?;
    Ok(Json(json!({ "ok": true, "task": task })))
}

/// `GET /ops/tasks/:id/activities`
pub async fn get_activities(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let activities = state.engine.list_activities(&id)?;
    Ok(Json(json!({ "ok": true, "activities": activities })))
}

/// `GET /ops/tasks?state=&group=&limit=`
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let limit = query_limit(&params)?;
    let list = state
        .engine
        .store()
        .read(|conn| {
            tasks::list(
                conn,
                params.get("state").map(String::as_str),
                params.get("group").map(String::as_str),
                limit,
            )
        })
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({ "ok": true, "tasks": list })))
}

/// `GET /ops/products`
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let list = state
        .engine
        .store()
        .read(products::list)
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({ "ok": true, "products": list })))
}

/// `GET /ops/topics?group=`
pub async fn list_topics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let group = params
        .get("group")
        .ok_or_else(|| ApiError::Validation("missing query parameter: group".to_string()))?;
    let list = state
        .engine
        .store()
        .read(|conn| chat::list_topics(conn, group))
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({ "ok": true, "topics": list })))
}

/// `GET /ops/messages?limit=&before=`
///
/// Returns `{ messages: [...], group_jid }` with messages ascending by
/// timestamp, matching the cockpit's wire contract.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let limit = query_limit(&params)?;
    let messages = state
        .engine
        .store()
        .read(|conn| chat::list_messages(conn, limit, params.get("before").map(String::as_str)))
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({
        "messages": messages,
        "group_jid": state.config.chat_group_jid,
    })))
}

/// `GET /ops/notifications?target_group=&unread_only=1&limit=`
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    auth::require_read(&state.config, &headers)?;
    let group = params.get("target_group").ok_or_else(|| {
        ApiError::Validation("missing query parameter: target_group".to_string())
    })?;
    let unread_only = params.get("unread_only").map(String::as_str) == Some("1");
    let limit = query_limit(&params)?;
    let (list, unread) = state
        .engine
        .store()
        .read(|conn| {
            let list = notifications::list(conn, group, unread_only, limit)?;
            let unread = notifications::unread_count(conn, group)?;
            Ok((list, unread))
        })
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({
        "ok": true,
        "notifications": list,
        "unreadCount": unread,
    })))
}
