//! Task row queries.

use opsd_core::task::{Task, TaskMetadata};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;

fn row_to_task(row: &Row<'_>) -> Result<Task, StoreError> {
    let parse = |field: &'static str, value: String| {
        move |err: opsd_core::task::ParseEnumError| {
            StoreError::corrupt(format!("tasks.{field} = {value:?}: {err}"))
        }
    };

    let task_type: String = row.get("task_type")?;
    let state: String = row.get("state")?;
    let priority: String = row.get("priority")?;
    let scope: String = row.get("scope")?;
    let gate: String = row.get("gate")?;
    let metadata_raw: String = row.get("metadata")?;

    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        task_type: task_type
            .parse()
            .map_err(parse("task_type", task_type.clone()))?,
        state: state.parse().map_err(parse("state", state.clone()))?,
        priority: priority
            .parse()
            .map_err(parse("priority", priority.clone()))?,
        scope: scope.parse().map_err(parse("scope", scope.clone()))?,
        product_id: row.get("product_id")?,
        assigned_group: row.get("assigned_group")?,
        executor: row.get("executor")?,
        created_by: row.get("created_by")?,
        gate: gate.parse().map_err(parse("gate", gate.clone()))?,
        dod_required: row.get::<_, i64>("dod_required")? != 0,
        metadata: TaskMetadata::from_storage(Some(&metadata_raw))
            .map_err(|e| StoreError::corrupt(format!("tasks.metadata: {e}")))?,
        version: row.get("version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Inserts a new task row.
///
/// # Errors
///
/// Surfaces the primary-key violation on id collision so the caller can
/// retry with a fresh suffix.
pub fn insert(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let metadata = task
        .metadata
        .to_storage()
        .map_err(|e| StoreError::corrupt(format!("metadata serialize: {e}")))?;
    conn.execute(
        "INSERT INTO tasks (
            id, title, description, task_type, state, priority, scope,
            product_id, assigned_group, executor, created_by, gate,
            dod_required, metadata, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            task.id,
            task.title,
            task.description,
            task.task_type.as_str(),
            task.state.as_str(),
            task.priority.as_str(),
            task.scope.as_str(),
            task.product_id,
            task.assigned_group,
            task.executor,
            task.created_by,
            task.gate.as_str(),
            i64::from(task.dod_required),
            metadata,
            task.version,
            task.created_at,
            task.updated_at,
        ],
    )?;
    Ok(())
}

/// Fetches one task by id.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] when a stored enum or the metadata
/// blob no longer parses.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Task>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
    let task = stmt
        .query_row(params![id], |row| {
            // Defer domain parsing so we can distinguish corrupt rows
            // from absent ones.
            Ok(row_to_task(row))
        })
        .optional()?;
    task.transpose()
}

/// Persists mutated task fields and bumps the version by one.
///
/// The caller supplies the task as read (pre-bump); the row's version
/// becomes `task.version + 1`.
///
/// # Errors
///
/// Returns [`StoreError`] on serialization or SQL failure.
pub fn update(conn: &Connection, task: &Task, updated_at: &str) -> Result<(), StoreError> {
    let metadata = task
        .metadata
        .to_storage()
        .map_err(|e| StoreError::corrupt(format!("metadata serialize: {e}")))?;
    conn.execute(
        "UPDATE tasks SET
            title = ?2, description = ?3, state = ?4, priority = ?5,
            scope = ?6, product_id = ?7, assigned_group = ?8, executor = ?9,
            gate = ?10, dod_required = ?11, metadata = ?12,
            version = version + 1, updated_at = ?13
         WHERE id = ?1",
        params![
            task.id,
            task.title,
            task.description,
            task.state.as_str(),
            task.priority.as_str(),
            task.scope.as_str(),
            task.product_id,
            task.assigned_group,
            task.executor,
            task.gate.as_str(),
            i64::from(task.dod_required),
            metadata,
            updated_at,
        ],
    )?;
    Ok(())
}

/// Lists tasks, optionally filtered by state and/or assigned group,
/// newest first.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn list(
    conn: &Connection,
    state: Option<&str>,
    group: Option<&str>,
    limit: u32,
) -> Result<Vec<Task>, StoreError> {
    let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
    let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
    if let Some(state) = &state {
        sql.push_str(" AND state = ?");
        args.push(state);
    }
    if let Some(group) = &group {
        sql.push_str(" AND assigned_group = ?");
        args.push(group);
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
    let limit = i64::from(limit);
    args.push(&limit);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args.as_slice(), |row| Ok(row_to_task(row)))?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row??);
    }
    Ok(tasks)
}
