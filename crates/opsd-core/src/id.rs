//! Identifier minting and UTC timestamps.
//!
//! Task identifiers embed a wall-clock component so the audit trail sorts
//! naturally, plus a short random suffix to keep concurrent creation from
//! colliding. Collisions are still possible under the same second; callers
//! insert with a uniqueness constraint and retry with a fresh suffix.

use chrono::{SecondsFormat, Utc};
use rand::Rng;

/// Prefix carried by every governed task identifier.
pub const TASK_ID_PREFIX: &str = "gov-";

/// Prefix carried by Definition-of-Done checklist item identifiers.
pub const DOD_ID_PREFIX: &str = "dod-";

/// Prefix carried by cockpit chat topic identifiers.
pub const TOPIC_ID_PREFIX: &str = "topic-";

/// Length of the random suffix on task identifiers.
const TASK_SUFFIX_LEN: usize = 6;

/// Length of the random component of DoD item and topic identifiers.
const SHORT_ID_LEN: usize = 8;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Returns the current UTC time as an ISO-8601 string with millisecond
/// precision, e.g. `2026-08-02T09:15:42.123Z`.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Mints a fresh task identifier of the form
/// `gov-<YYYYMMDD>T<HHMMSS>Z-<6 lowercase alnum>`.
#[must_use]
pub fn new_task_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    format!("{TASK_ID_PREFIX}{stamp}-{}", random_suffix(TASK_SUFFIX_LEN))
}

/// Mints a stable Definition-of-Done item identifier (`dod-<random>`).
#[must_use]
pub fn new_dod_id() -> String {
    format!("{DOD_ID_PREFIX}{}", random_suffix(SHORT_ID_LEN))
}

/// Mints a chat topic identifier (`topic-<random>`).
#[must_use]
pub fn new_topic_id() -> String {
    format!("{TOPIC_ID_PREFIX}{}", random_suffix(SHORT_ID_LEN))
}

/// Mints a broker request identifier.
#[must_use]
pub fn new_request_id() -> String {
    format!("ext-{}", uuid::Uuid::new_v4())
}

/// Returns true when `id` is a well-formed task identifier.
///
/// Used at ingress so malformed identifiers fail fast instead of producing
/// empty query results deeper in the stack.
#[must_use]
pub fn is_task_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix(TASK_ID_PREFIX) else {
        return false;
    };
    let mut parts = rest.splitn(2, '-');
    let (Some(stamp), Some(suffix)) = (parts.next(), parts.next()) else {
        return false;
    };
    stamp.len() == 16
        && stamp.ends_with('Z')
        && suffix.len() == TASK_SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
