//! Approval queries. One row per `(task, gate)`; a repeat approval
//! replaces the earlier row (idempotent upsert).

use opsd_core::record::Approval;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;

fn row_to_approval(row: &Row<'_>) -> rusqlite::Result<Approval> {
    Ok(Approval {
        task_id: row.get("task_id")?,
        gate_type: row.get("gate_type")?,
        approved_by: row.get("approved_by")?,
        notes: row.get("notes")?,
        evidence_link: row.get("evidence_link")?,
        created_at: row.get("created_at")?,
    })
}

/// Upserts an approval for `(task_id, gate_type)`.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn upsert(conn: &Connection, approval: &Approval) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO approvals (task_id, gate_type, approved_by, notes, evidence_link, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (task_id, gate_type) DO UPDATE SET
             approved_by = excluded.approved_by,
             notes = excluded.notes,
             evidence_link = excluded.evidence_link,
             created_at = excluded.created_at",
        params![
            approval.task_id,
            approval.gate_type,
            approval.approved_by,
            approval.notes,
            approval.evidence_link,
            approval.created_at,
        ],
    )?;
    Ok(())
}

/// Fetches the approval for `(task_id, gate_type)`, if any.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn get(
    conn: &Connection,
    task_id: &str,
    gate_type: &str,
) -> Result<Option<Approval>, StoreError> {
    let approval = conn
        .query_row(
            "SELECT * FROM approvals WHERE task_id = ?1 AND gate_type = ?2",
            params![task_id, gate_type],
            row_to_approval,
        )
        .optional()?;
    Ok(approval)
}

/// Lists all approvals recorded on a task.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn list_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Approval>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT * FROM approvals WHERE task_id = ?1 ORDER BY created_at ASC")?;
    let rows = stmt.query_map(params![task_id], row_to_approval)?;
    let mut approvals = Vec::new();
    for row in rows {
        approvals.push(row?);
    }
    Ok(approvals)
}

/// Returns true when any approval on the task carries an evidence link.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn any_with_evidence_link(conn: &Connection, task_id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM approvals
         WHERE task_id = ?1 AND evidence_link IS NOT NULL AND evidence_link != ''",
        params![task_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
