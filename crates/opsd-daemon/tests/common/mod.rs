//! Shared helpers for the integration suites.
#![allow(dead_code)] // Each suite uses its own subset of the helpers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use opsd_core::events::EventBus;
use opsd_core::group::GroupRegistry;
use opsd_daemon::broker::{BrokerLimits, ExtBroker};
use opsd_daemon::config::Config;
use opsd_daemon::engine::GovernanceEngine;
use opsd_daemon::http::{router, AppState};
use opsd_daemon::store::Store;
use secrecy::SecretString;
use serde_json::Value;
use tower::util::ServiceExt;

/// Read secret used by every test request.
pub const READ_SECRET: &str = "test-read-secret-0123456789";

/// Current write secret used by every test request.
pub const WRITE_SECRET: &str = "test-write-secret-0123456789";

/// Previous write secret, for rotation tests.
pub const OLD_WRITE_SECRET: &str = "old-write-secret-0123456789";

/// Builds a config with fixed test secrets.
pub fn test_config(strict: bool) -> Config {
    Config {
        http_secret: SecretString::from(READ_SECRET),
        write_secret_current: Some(SecretString::from(WRITE_SECRET)),
        write_secret_previous: Some(SecretString::from(OLD_WRITE_SECRET)),
        strict,
        telegram_bot_token: None,
        telegram_chat_id: None,
        alerts: opsd_core::alerts::AlertConfig::default(),
        ext_call_hmac_secret: SecretString::from("test-hmac-secret"),
        ext_backpressure_limit: 10,
        ext_rate_limit_max: 1000,
        ext_rate_limit_window: Duration::from_secs(60),
        ext_daily_quota: 10_000,
        chat_group_jid: Some("ops@chat.example".to_string()),
        store_dir: PathBuf::from("unused-in-tests"),
        http_port: 0,
    }
}

/// Builds an engine over a fresh in-memory store.
pub fn engine(strict: bool) -> GovernanceEngine {
    GovernanceEngine::new(
        Store::open_in_memory().unwrap(),
        EventBus::default(),
        GroupRegistry::default(),
        strict,
    )
}

/// Builds the full HTTP app over a fresh in-memory store.
pub fn app(strict: bool) -> (Router, Arc<AppState>) {
    let store = Store::open_in_memory().unwrap();
    let config = test_config(strict);
    let engine = GovernanceEngine::new(
        store.clone(),
        EventBus::default(),
        GroupRegistry::default(),
        strict,
    );
    let broker = ExtBroker::new(
        store,
        SecretString::from("test-hmac-secret"),
        BrokerLimits::default(),
    );
    let state = Arc::new(AppState {
        engine,
        broker,
        config,
    });
    (router(Arc::clone(&state)), state)
}

/// Issues a POST with both secrets and returns `(status, body)`.
pub async fn post(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    send(router, "POST", path, Some(body), Some(READ_SECRET), Some(WRITE_SECRET)).await
}

/// Issues a GET with the read secret and returns `(status, body)`.
pub async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
    send(router, "GET", path, None, Some(READ_SECRET), None).await
}

/// Issues a request with explicit secrets (either may be omitted).
pub async fn send(
    router: &Router,
    method: &str,
    path: &str,
    body: Option<Value>,
    read_secret: Option<&str>,
    write_secret: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json; charset=utf-8");
    if let Some(secret) = read_secret {
        builder = builder.header("x-os-secret", secret);
    }
    if let Some(secret) = write_secret {
        builder = builder.header("x-write-secret", secret);
    }
    let request = builder
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
