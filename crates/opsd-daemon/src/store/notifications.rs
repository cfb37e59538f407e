//! Notification queries.

use opsd_core::record::Notification;
use rusqlite::{params, Connection, Row};

use super::StoreError;

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        target_group: row.get("target_group")?,
        actor: row.get("actor")?,
        snippet: row.get("snippet")?,
        read: row.get::<_, i64>("read")? != 0,
        created_at: row.get("created_at")?,
    })
}

/// Inserts one unread notification row.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn insert(
    conn: &Connection,
    task_id: &str,
    target_group: &str,
    actor: &str,
    snippet: &str,
    created_at: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO notifications (task_id, target_group, actor, snippet, read, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![task_id, target_group, actor, snippet, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Marks the given ids read, returning how many rows actually flipped.
///
/// Already-read ids do not count, which is what makes a repeated
/// `markRead` report zero.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn mark_read(conn: &Connection, ids: &[i64]) -> Result<usize, StoreError> {
    let mut flipped = 0;
    for id in ids {
        flipped += conn.execute(
            "UPDATE notifications SET read = 1 WHERE id = ?1 AND read = 0",
            params![id],
        )?;
    }
    Ok(flipped)
}

/// Lists notifications for a group, newest first.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn list(
    conn: &Connection,
    target_group: &str,
    unread_only: bool,
    limit: u32,
) -> Result<Vec<Notification>, StoreError> {
    let sql = if unread_only {
        "SELECT * FROM notifications WHERE target_group = ?1 AND read = 0
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    } else {
        "SELECT * FROM notifications WHERE target_group = ?1
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![target_group, limit], row_to_notification)?;
    let mut notifications = Vec::new();
    for row in rows {
        notifications.push(row?);
    }
    Ok(notifications)
}

/// Counts unread notifications for a group.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn unread_count(conn: &Connection, target_group: &str) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE target_group = ?1 AND read = 0",
        params![target_group],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use opsd_core::id::now_iso;

    use super::*;
    use crate::store::Store;

    fn seed_task(conn: &Connection, id: &str) {
        use opsd_core::task::{
            Gate, Priority, Scope, Task, TaskMetadata, TaskState, TaskType,
        };
        let now = now_iso();
        crate::store::tasks::insert(
            conn,
            &Task {
                id: id.to_string(),
                title: "t".to_string(),
                description: None,
                task_type: TaskType::Feature,
                state: TaskState::Inbox,
                priority: Priority::P2,
                scope: Scope::Company,
                product_id: None,
                assigned_group: "developer".to_string(),
                executor: None,
                created_by: "main".to_string(),
                gate: Gate::None,
                dod_required: false,
                metadata: TaskMetadata::default(),
                version: 1,
                created_at: now.clone(),
                updated_at: now,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_mark_read_counts_only_flips() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let task_id = "gov-20260802T090000Z-abc123";
        seed_task(&conn, task_id);

        let now = now_iso();
        let a = insert(&conn, task_id, "developer", "cockpit", "cc @developer", &now).unwrap();
        let b = insert(&conn, task_id, "security", "cockpit", "cc @security", &now).unwrap();

        assert_eq!(mark_read(&conn, &[a, b]).unwrap(), 2);
        // Second pass: nothing left to flip.
        assert_eq!(mark_read(&conn, &[a, b]).unwrap(), 0);
        // Unknown ids flip nothing.
        assert_eq!(mark_read(&conn, &[999]).unwrap(), 0);
    }

    #[test]
    fn test_unread_filtering_and_count() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let task_id = "gov-20260802T090000Z-abc123";
        seed_task(&conn, task_id);

        let now = now_iso();
        let a = insert(&conn, task_id, "developer", "cockpit", "one", &now).unwrap();
        insert(&conn, task_id, "developer", "cockpit", "two", &now).unwrap();

        assert_eq!(unread_count(&conn, "developer").unwrap(), 2);
        mark_read(&conn, &[a]).unwrap();
        assert_eq!(unread_count(&conn, "developer").unwrap(), 1);
        assert_eq!(list(&conn, "developer", true, 50).unwrap().len(), 1);
        assert_eq!(list(&conn, "developer", false, 50).unwrap().len(), 2);
    }
}
