//! HTTP error taxonomy.
//!
//! Every failure surfaces as a JSON body `{"error": "..."}` with a
//! status code from the fixed taxonomy. Internal failures are logged
//! with detail but answer with a generic message - store errors can
//! reference row contents and must not leak.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::engine::GovernanceError;

/// API-visible error.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid secret.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed.
    #[error("{0}")]
    Forbidden(String),

    /// Input failed validation; the message names the failing field or
    /// bound.
    #[error("{0}")]
    Validation(String),

    /// Unknown entity.
    #[error("{0}")]
    NotFound(String),

    /// Stale `expectedVersion` or similar write race.
    #[error("{0}")]
    Conflict(String),

    /// Policy kernel denial (graph edge, strict validators).
    #[error("{0}")]
    PolicyDenied(String),

    /// Broker capacity rejection (backpressure, rate, quota).
    #[error("{0}")]
    Capacity(String),

    /// Anything else; detail is logged, not returned.
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl ApiError {
    /// Returns the HTTP status for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) | Self::PolicyDenied(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Internal(source) => {
                tracing::error!(error = %source, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::NotFound { .. } => Self::NotFound(err.to_string()),
            GovernanceError::Forbidden { .. } => Self::Forbidden(err.to_string()),
            GovernanceError::Validation(message) => Self::Validation(message),
            GovernanceError::StaleVersion { .. } => Self::Conflict(err.to_string()),
            GovernanceError::PolicyDenied { .. } => Self::PolicyDenied(err.to_string()),
            GovernanceError::Store(store) => Self::Internal(store.into()),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Denied { .. } => Self::Forbidden(err.to_string()),
            BrokerError::Capacity { .. } => Self::Capacity(err.to_string()),
            BrokerError::Validation(message) => Self::Validation(message),
            BrokerError::Store(store) => Self::Internal(store.into()),
        }
    }
}
