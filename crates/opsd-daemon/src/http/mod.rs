//! The HTTP command surface.
//!
//! One axum router on one port. Reads authenticate with the read secret;
//! mutations additionally require the write secret (dual-secret rotation
//! accepted). The handlers are strictly validators and status mappers:
//! every mutation funnels into the governance engine or the broker, so
//! the HTTP layer holds no business rules of its own.

pub mod auth;
pub mod error;
mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

pub use error::ApiError;

use crate::broker::ExtBroker;
use crate::config::Config;
use crate::engine::GovernanceEngine;

/// Maximum accepted request body size.
pub const MAX_BODY_SIZE: usize = 256 * 1024;

/// Shared state behind the router.
pub struct AppState {
    /// The governance engine (owns the store's write path).
    pub engine: GovernanceEngine,
    /// The external-access broker.
    pub broker: ExtBroker,
    /// Daemon configuration (secrets, strict flag, chat JID).
    pub config: Config,
}

/// Builds the router over the shared state.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/ops/actions/create", post(handlers::create))
        .route("/ops/actions/transition", post(handlers::transition))
        .route("/ops/actions/assign", post(handlers::assign))
        .route("/ops/actions/approve", post(handlers::approve))
        .route("/ops/actions/override", post(handlers::override_gate))
        .route("/ops/actions/comment", post(handlers::comment))
        .route("/ops/actions/dod", post(handlers::dod))
        .route("/ops/actions/evidence", post(handlers::evidence))
        .route("/ops/actions/evidence/bulk", post(handlers::evidence_bulk))
        .route("/ops/actions/docsUpdated", post(handlers::docs_updated))
        .route(
            "/ops/actions/notifications/markRead",
            post(handlers::mark_read),
        )
        .route("/ops/actions/chat", post(handlers::chat))
        .route("/ops/actions/topic", post(handlers::topic))
        .route("/ops/ext/call", post(handlers::ext_call))
        .route("/ops/ext/status", post(handlers::ext_status))
        .route("/ops/ext/calls", get(handlers::list_ext_calls))
        .route("/ops/tasks", get(handlers::list_tasks))
        .route("/ops/tasks/:id", get(handlers::get_task))
        .route("/ops/tasks/:id/activities", get(handlers::get_activities))
        .route("/ops/products", get(handlers::list_products))
        .route("/ops/topics", get(handlers::list_topics))
        .route("/ops/messages", get(handlers::list_messages))
        .route("/ops/notifications", get(handlers::list_notifications))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
