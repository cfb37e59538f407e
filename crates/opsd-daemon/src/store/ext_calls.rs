//! External-call audit record queries.
//!
//! Rows are append-only from the caller's perspective; only the executor
//! callback mutates status fields, and only the cleanup sweep deletes
//! terminal rows.

use opsd_core::capability::{AccessLevel, ExtCall, ExtCallStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;

fn row_to_call(row: &Row<'_>) -> Result<ExtCall, StoreError> {
    let level: i64 = row.get("access_level")?;
    let level = u8::try_from(level)
        .ok()
        .and_then(AccessLevel::from_u8)
        .ok_or_else(|| StoreError::corrupt(format!("ext_calls.access_level = {level}")))?;
    let status: String = row.get("status")?;
    let status = ExtCallStatus::parse(&status)
        .ok_or_else(|| StoreError::corrupt(format!("ext_calls.status = {status:?}")))?;
    Ok(ExtCall {
        request_id: row.get("request_id")?,
        group_folder: row.get("group_folder")?,
        provider: row.get("provider")?,
        action: row.get("action")?,
        access_level: level,
        params_hmac: row.get("params_hmac")?,
        params_summary: row.get("params_summary")?,
        status,
        denial_reason: row.get("denial_reason")?,
        result_summary: row.get("result_summary")?,
        response_data: row.get("response_data")?,
        task_id: row.get("task_id")?,
        product_id: row.get("product_id")?,
        idempotency_key: row.get("idempotency_key")?,
        duration_ms: row.get("duration_ms")?,
        created_at: row.get("created_at")?,
    })
}

/// Inserts a call record.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn insert(conn: &Connection, call: &ExtCall) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO ext_calls (
            request_id, group_folder, provider, action, access_level,
            params_hmac, params_summary, status, denial_reason, result_summary,
            response_data, task_id, product_id, idempotency_key, duration_ms,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            call.request_id,
            call.group_folder,
            call.provider,
            call.action,
            i64::from(call.access_level.as_u8()),
            call.params_hmac,
            call.params_summary,
            call.status.as_str(),
            call.denial_reason,
            call.result_summary,
            call.response_data,
            call.task_id,
            call.product_id,
            call.idempotency_key,
            call.duration_ms,
            call.created_at,
        ],
    )?;
    Ok(())
}

/// Fetches one call by request id.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn get(conn: &Connection, request_id: &str) -> Result<Option<ExtCall>, StoreError> {
    let call = conn
        .query_row(
            "SELECT * FROM ext_calls WHERE request_id = ?1",
            params![request_id],
            |row| Ok(row_to_call(row)),
        )
        .optional()?;
    call.transpose()
}

/// Updates a call's status and executor-reported fields.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn update_status(
    conn: &Connection,
    request_id: &str,
    status: ExtCallStatus,
    result_summary: Option<&str>,
    response_data: Option<&str>,
    duration_ms: Option<i64>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE ext_calls SET
            status = ?2,
            result_summary = COALESCE(?3, result_summary),
            response_data = COALESCE(?4, response_data),
            duration_ms = COALESCE(?5, duration_ms)
         WHERE request_id = ?1",
        params![request_id, status.as_str(), result_summary, response_data, duration_ms],
    )?;
    Ok(())
}

/// Counts a group's pending (`authorized` or `processing`) calls.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn pending_count(conn: &Connection, group_folder: &str) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM ext_calls
         WHERE group_folder = ?1 AND status IN ('authorized', 'processing')",
        params![group_folder],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Finds the most recent executed call matching an idempotency tuple.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn find_executed_by_key(
    conn: &Connection,
    idempotency_key: &str,
    provider: &str,
    action: &str,
) -> Result<Option<ExtCall>, StoreError> {
    let call = conn
        .query_row(
            "SELECT * FROM ext_calls
             WHERE idempotency_key = ?1 AND provider = ?2 AND action = ?3
               AND status = 'executed'
             ORDER BY created_at DESC LIMIT 1",
            params![idempotency_key, provider, action],
            |row| Ok(row_to_call(row)),
        )
        .optional()?;
    call.transpose()
}

/// Counts a group's calls created on or after `since_iso` against one
/// provider, for daily-quota enforcement.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn count_since(
    conn: &Connection,
    group_folder: &str,
    provider: &str,
    since_iso: &str,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM ext_calls
         WHERE group_folder = ?1 AND provider = ?2 AND created_at >= ?3
           AND status != 'denied'",
        params![group_folder, provider, since_iso],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Lists calls, optionally for one group, newest first.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn list(
    conn: &Connection,
    group_folder: Option<&str>,
    limit: u32,
) -> Result<Vec<ExtCall>, StoreError> {
    let mut calls = Vec::new();
    if let Some(group) = group_folder {
        let mut stmt = conn.prepare(
            "SELECT * FROM ext_calls WHERE group_folder = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![group, limit], |row| Ok(row_to_call(row)))?;
        for row in rows {
            calls.push(row??);
        }
    } else {
        let mut stmt =
            conn.prepare("SELECT * FROM ext_calls ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], |row| Ok(row_to_call(row)))?;
        for row in rows {
            calls.push(row??);
        }
    }
    Ok(calls)
}

/// Deletes terminal-status rows older than `cutoff_iso`.
///
/// `processing` rows are preserved regardless of age - they represent
/// inflight requests.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn sweep_terminal(conn: &Connection, cutoff_iso: &str) -> Result<usize, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM ext_calls
         WHERE created_at < ?1
           AND status IN ('executed', 'denied', 'failed', 'timeout')",
        params![cutoff_iso],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use opsd_core::id::{new_request_id, now_iso};

    use super::*;
    use crate::store::Store;

    fn call(group: &str, status: ExtCallStatus) -> ExtCall {
        ExtCall {
            request_id: new_request_id(),
            group_folder: group.to_string(),
            provider: "github".to_string(),
            action: "create_issue".to_string(),
            access_level: AccessLevel::L2,
            params_hmac: "deadbeef".to_string(),
            params_summary: "{title=string(5)}".to_string(),
            status,
            denial_reason: None,
            result_summary: None,
            response_data: None,
            task_id: None,
            product_id: None,
            idempotency_key: None,
            duration_ms: None,
            created_at: now_iso(),
        }
    }

    #[test]
    fn test_pending_count() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        insert(&conn, &call("developer", ExtCallStatus::Authorized)).unwrap();
        insert(&conn, &call("developer", ExtCallStatus::Processing)).unwrap();
        insert(&conn, &call("developer", ExtCallStatus::Executed)).unwrap();
        insert(&conn, &call("security", ExtCallStatus::Authorized)).unwrap();
        assert_eq!(pending_count(&conn, "developer").unwrap(), 2);
        assert_eq!(pending_count(&conn, "security").unwrap(), 1);
    }

    #[test]
    fn test_idempotency_lookup() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let mut executed = call("developer", ExtCallStatus::Executed);
        executed.idempotency_key = Some("idem-1".to_string());
        executed.response_data = Some(r#"{"issue": 42}"#.to_string());
        insert(&conn, &executed).unwrap();

        let found = find_executed_by_key(&conn, "idem-1", "github", "create_issue")
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, executed.request_id);

        // Same key, different provider: no match.
        assert!(find_executed_by_key(&conn, "idem-1", "stripe", "create_issue")
            .unwrap()
            .is_none());
        // Non-executed rows never satisfy the replay lookup.
        let mut pending = call("developer", ExtCallStatus::Authorized);
        pending.idempotency_key = Some("idem-2".to_string());
        insert(&conn, &pending).unwrap();
        assert!(find_executed_by_key(&conn, "idem-2", "github", "create_issue")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_sweep_preserves_processing() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let mut old_done = call("developer", ExtCallStatus::Executed);
        old_done.created_at = "2026-01-01T00:00:00.000Z".to_string();
        let mut old_inflight = call("developer", ExtCallStatus::Processing);
        old_inflight.created_at = "2026-01-01T00:00:00.000Z".to_string();
        insert(&conn, &old_done).unwrap();
        insert(&conn, &old_inflight).unwrap();

        let deleted = sweep_terminal(&conn, "2026-06-01T00:00:00.000Z").unwrap();
        assert_eq!(deleted, 1);
        assert!(get(&conn, &old_done.request_id).unwrap().is_none());
        assert!(get(&conn, &old_inflight.request_id).unwrap().is_some());
    }

    #[test]
    fn test_update_status_preserves_existing_fields() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let c = call("developer", ExtCallStatus::Authorized);
        insert(&conn, &c).unwrap();

        update_status(
            &conn,
            &c.request_id,
            ExtCallStatus::Processing,
            Some("picked up"),
            None,
            None,
        )
        .unwrap();
        update_status(
            &conn,
            &c.request_id,
            ExtCallStatus::Executed,
            None,
            Some(r#"{"ok":true}"#),
            Some(840),
        )
        .unwrap();

        let loaded = get(&conn, &c.request_id).unwrap().unwrap();
        assert_eq!(loaded.status, ExtCallStatus::Executed);
        assert_eq!(loaded.result_summary.as_deref(), Some("picked up"));
        assert_eq!(loaded.duration_ms, Some(840));
    }
}
