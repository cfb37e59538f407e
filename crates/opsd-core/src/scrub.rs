//! Secret scrubbing, comment sanitization, and mention parsing.
//!
//! Everything that leaves the trust boundary passes through here: event
//! payloads and stored provider responses are deep-scrubbed of secret-like
//! keys, comments are stripped of markup before persistence, and broker
//! parameters are reduced to type/length summaries so raw values are never
//! written anywhere.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::group::GroupRegistry;

/// Replacement inserted for values under forbidden keys.
pub const REDACTED: &str = "[redacted]";

/// Maximum raw comment length accepted before sanitization.
pub const MAX_COMMENT_LEN: usize = 4000;

/// Maximum actor label length; longer actors fall back to the default.
pub const MAX_ACTOR_LEN: usize = 50;

/// Actor recorded when the caller supplies none (or an oversized one).
pub const DEFAULT_COMMENT_ACTOR: &str = "cockpit";

fn forbidden_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(.*secret.*|.*token.*|.*password.*|.*_key|ssh_identity_file)$")
            .expect("forbidden-key pattern is valid")
    })
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([a-z][a-z0-9_-]{0,49})").expect("mention pattern is valid"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"))
}

/// Returns true when `key` must never carry a raw value.
#[must_use]
pub fn is_forbidden_key(key: &str) -> bool {
    forbidden_key_re().is_match(key)
}

/// Deep-scrubs a JSON value in place, replacing every value whose key
/// matches the forbidden pattern with [`REDACTED`].
///
/// Arrays and nested objects are walked; non-object roots are untouched.
pub fn scrub_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_forbidden_key(key) {
                    *val = Value::String(REDACTED.to_string());
                } else {
                    scrub_value(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                scrub_value(item);
            }
        }
        _ => {}
    }
}

/// Errors produced by comment sanitization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommentError {
    /// The raw comment exceeds [`MAX_COMMENT_LEN`] characters.
    #[error("comment exceeds {MAX_COMMENT_LEN} characters")]
    TooLong,
    /// Nothing is left after stripping markup and trimming.
    #[error("comment is empty after sanitization")]
    Empty,
}

/// Sanitizes a comment: rejects oversized input, strips `<…>` runs, trims,
/// and rejects empty results.
///
/// # Errors
///
/// Returns [`CommentError::TooLong`] for raw input over the limit and
/// [`CommentError::Empty`] when sanitization leaves nothing.
pub fn sanitize_comment(raw: &str) -> Result<String, CommentError> {
    if raw.chars().count() > MAX_COMMENT_LEN {
        return Err(CommentError::TooLong);
    }
    let stripped = tag_re().replace_all(raw, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return Err(CommentError::Empty);
    }
    Ok(trimmed.to_string())
}

/// Normalizes a comment actor: missing or oversized actors fall back to
/// [`DEFAULT_COMMENT_ACTOR`].
#[must_use]
pub fn normalize_actor(actor: Option<&str>) -> String {
    match actor {
        Some(a) if !a.is_empty() && a.chars().count() <= MAX_ACTOR_LEN => a.to_string(),
        _ => DEFAULT_COMMENT_ACTOR.to_string(),
    }
}

/// Parses `@group` mentions from sanitized comment text.
///
/// Only groups known to the registry are returned; duplicates collapse to
/// one entry, preserving first-mention order.
#[must_use]
pub fn parse_mentions(text: &str, registry: &GroupRegistry) -> Vec<String> {
    let mut seen = Vec::new();
    for capture in mention_re().captures_iter(text) {
        let name = &capture[1];
        if registry.is_known(name) && !seen.iter().any(|s| s == name) {
            seen.push(name.to_string());
        }
    }
    seen
}

/// Produces a human-readable summary of call parameters with every value
/// replaced by its type (and length for strings/collections).
///
/// The summary is safe to store and log; raw values never appear in it.
#[must_use]
pub fn summarize_params(params: &Value) -> String {
    match params {
        Value::Object(map) => {
            let mut parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k}={}", type_label(v)))
                .collect();
            parts.sort();
            format!("{{{}}}", parts.join(", "))
        }
        other => type_label(other),
    }
}

fn type_label(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(s) => format!("string({})", s.chars().count()),
        Value::Array(items) => format!("array({})", items.len()),
        Value::Object(map) => format!("object({})", map.len()),
    }
}
