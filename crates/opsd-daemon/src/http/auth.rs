//! Dual-secret request authentication.
//!
//! Every request presents the read secret in `X-OS-SECRET`. Mutations
//! additionally present `X-WRITE-SECRET`, checked against both the
//! current and previous write secrets so rotation never drops writes.
//! All comparisons are constant-time.

use axum::http::HeaderMap;

use super::error::ApiError;
use crate::config::Config;

/// Header carrying the read secret.
pub const READ_SECRET_HEADER: &str = "x-os-secret";

/// Header carrying the write secret.
pub const WRITE_SECRET_HEADER: &str = "x-write-secret";

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authenticates a read request.
///
/// # Errors
///
/// Returns [`ApiError::Unauthorized`] when the header is missing or
/// wrong.
pub fn require_read(config: &Config, headers: &HeaderMap) -> Result<(), ApiError> {
    match header_value(headers, READ_SECRET_HEADER) {
        Some(presented) if config.read_secret_matches(presented) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Authenticates a mutating request: read secret plus write secret.
///
/// # Errors
///
/// Returns [`ApiError::Unauthorized`] when either header is missing or
/// wrong.
pub fn require_write(config: &Config, headers: &HeaderMap) -> Result<(), ApiError> {
    require_read(config, headers)?;
    match header_value(headers, WRITE_SECRET_HEADER) {
        Some(presented) if config.write_secret_matches(presented) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}
