//! Activity (audit log) queries. Append-only: no update or delete path
//! exists outside of tests.

use opsd_core::record::{Activity, ActivityAction};
use opsd_core::task::TaskState;
use rusqlite::{params, Connection, Row};

use super::StoreError;

/// Fields of a new activity row.
#[derive(Debug, Clone)]
pub struct NewActivity<'a> {
    /// Task the entry belongs to.
    pub task_id: &'a str,
    /// What happened.
    pub action: ActivityAction,
    /// Source state for transitions.
    pub from_state: Option<TaskState>,
    /// Target state for transitions.
    pub to_state: Option<TaskState>,
    /// Who did it.
    pub actor: &'a str,
    /// Free-form detail.
    pub reason: Option<&'a str>,
    /// Insertion timestamp.
    pub created_at: &'a str,
}

/// Appends one activity row.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure (including a dangling task id).
pub fn append(conn: &Connection, activity: &NewActivity<'_>) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO activities (task_id, action, from_state, to_state, actor, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            activity.task_id,
            activity.action.as_str(),
            activity.from_state.map(TaskState::as_str),
            activity.to_state.map(TaskState::as_str),
            activity.actor,
            activity.reason,
            activity.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_activity(row: &Row<'_>) -> Result<Activity, StoreError> {
    let action: String = row.get("action")?;
    let from_state: Option<String> = row.get("from_state")?;
    let to_state: Option<String> = row.get("to_state")?;
    let parse_state = |value: Option<String>| -> Result<Option<TaskState>, StoreError> {
        value
            .map(|s| {
                s.parse()
                    .map_err(|e| StoreError::corrupt(format!("activities state: {e}")))
            })
            .transpose()
    };

    Ok(Activity {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        action: action
            .parse()
            .map_err(|e| StoreError::corrupt(format!("activities.action: {e}")))?,
        from_state: parse_state(from_state)?,
        to_state: parse_state(to_state)?,
        actor: row.get("actor")?,
        reason: row.get("reason")?,
        created_at: row.get("created_at")?,
    })
}

/// Lists a task's activities in insertion order (total order per task).
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn list_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Activity>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM activities WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![task_id], |row| Ok(row_to_activity(row)))?;
    let mut activities = Vec::new();
    for row in rows {
        activities.push(row??);
    }
    Ok(activities)
}

/// Counts a task's activities with the given action.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn count_action(
    conn: &Connection,
    task_id: &str,
    action: ActivityAction,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM activities WHERE task_id = ?1 AND action = ?2",
        params![task_id, action.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}
