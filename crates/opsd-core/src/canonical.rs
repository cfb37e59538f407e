//! Canonical JSON encoding for parameter hashing.
//!
//! The broker never stores raw call parameters; it stores an HMAC over
//! their canonical encoding. Canonical form follows RFC 8785 (JCS) for
//! the properties that matter here: lexicographically sorted object keys,
//! no inter-token whitespace, and minimal string escaping. Two calls with
//! the same logical parameters therefore hash identically regardless of
//! key order in the request body.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum nesting depth accepted before canonicalization bails out.
pub const MAX_DEPTH: usize = 64;

/// Errors produced by canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    /// The value is nested deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: JSON nested deeper than {MAX_DEPTH} levels")]
    MaxDepthExceeded,
}

/// Canonicalizes a JSON value.
///
/// # Errors
///
/// Returns [`CanonicalError::MaxDepthExceeded`] for pathologically nested
/// input; everything else canonicalizes.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalError> {
    check_depth(value, 0)?;
    let mut out = String::new();
    emit_value(value, &mut out);
    Ok(out)
}

fn check_depth(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded);
    }
    match value {
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                check_depth(item, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn emit_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, out),
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => emit_object(map, out),
    }
}

fn emit_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else {
        // serde_json's float formatting is shortest-round-trip, which is
        // stable for a given value; sufficient for hashing equality.
        let _ = write!(out, "{n}");
    }
}

/// Minimal escaping per RFC 8785 §3.2.2.2: only `"`, `\`, and the C0
/// control characters are escaped.
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn emit_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit_value(&map[*key], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let v = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonical_json(&v).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_nested_keys_sorted() {
        let v = json!({"outer": {"z": 1, "a": 2}});
        assert_eq!(canonical_json(&v).unwrap(), r#"{"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn test_arrays_preserve_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_json(&v).unwrap(), "[3,1,2]");
    }

    #[test]
    fn test_key_order_invariance() {
        let a: Value = serde_json::from_str(r#"{"b": 2, "a": [1, {"y": 1, "x": 2}]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [1, {"x": 2, "y": 1}], "b": 2}"#).unwrap();
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn test_minimal_escaping() {
        let v = json!({"text": "line1\nline2\ttab \"quoted\""});
        assert_eq!(
            canonical_json(&v).unwrap(),
            r#"{"text":"line1\nline2\ttab \"quoted\""}"#
        );
    }

    #[test]
    fn test_control_chars_use_unicode_escape() {
        let v = json!({"text": "\u{0001}"});
        assert_eq!(canonical_json(&v).unwrap(), r#"{"text":"\u0001"}"#);
    }

    #[test]
    fn test_depth_limit() {
        let mut v = json!(0);
        for _ in 0..(MAX_DEPTH + 2) {
            v = json!({ "n": v });
        }
        assert_eq!(canonical_json(&v), Err(CanonicalError::MaxDepthExceeded));
    }

    #[test]
    fn test_primitives() {
        assert_eq!(canonical_json(&json!(null)).unwrap(), "null");
        assert_eq!(canonical_json(&json!(true)).unwrap(), "true");
        assert_eq!(canonical_json(&json!(42)).unwrap(), "42");
        assert_eq!(canonical_json(&json!(-7)).unwrap(), "-7");
    }
}
