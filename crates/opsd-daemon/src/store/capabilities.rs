//! Capability grant queries.

use opsd_core::capability::{AccessLevel, Capability};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;

fn parse_actions(raw: Option<String>) -> Result<Vec<String>, StoreError> {
    match raw {
        None => Ok(Vec::new()),
        Some(s) if s.is_empty() => Ok(Vec::new()),
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| StoreError::corrupt(format!("capabilities actions: {e}"))),
    }
}

fn row_to_capability(row: &Row<'_>) -> Result<Capability, StoreError> {
    let level: i64 = row.get("access_level")?;
    let level = u8::try_from(level)
        .ok()
        .and_then(AccessLevel::from_u8)
        .ok_or_else(|| StoreError::corrupt(format!("capabilities.access_level = {level}")))?;
    Ok(Capability {
        group_folder: row.get("group_folder")?,
        provider: row.get("provider")?,
        access_level: level,
        allowed_actions: parse_actions(row.get("allowed_actions")?)?,
        denied_actions: parse_actions(row.get("denied_actions")?)?,
        granted_by: row.get("granted_by")?,
        granted_at: row.get("granted_at")?,
        expires_at: row.get("expires_at")?,
        active: row.get::<_, i64>("active")? != 0,
    })
}

/// Upserts a grant for `(group, provider)`. Re-granting reactivates and
/// replaces the grant's fields.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn upsert(conn: &Connection, cap: &Capability) -> Result<(), StoreError> {
    let allowed = serde_json::to_string(&cap.allowed_actions)
        .map_err(|e| StoreError::corrupt(format!("allowed_actions serialize: {e}")))?;
    let denied = serde_json::to_string(&cap.denied_actions)
        .map_err(|e| StoreError::corrupt(format!("denied_actions serialize: {e}")))?;
    conn.execute(
        "INSERT INTO capabilities (
            group_folder, provider, access_level, allowed_actions, denied_actions,
            granted_by, granted_at, expires_at, active
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (group_folder, provider) DO UPDATE SET
            access_level = excluded.access_level,
            allowed_actions = excluded.allowed_actions,
            denied_actions = excluded.denied_actions,
            granted_by = excluded.granted_by,
            granted_at = excluded.granted_at,
            expires_at = excluded.expires_at,
            active = excluded.active",
        params![
            cap.group_folder,
            cap.provider,
            i64::from(cap.access_level.as_u8()),
            allowed,
            denied,
            cap.granted_by,
            cap.granted_at,
            cap.expires_at,
            i64::from(cap.active),
        ],
    )?;
    Ok(())
}

/// Fetches the grant for `(group, provider)` regardless of active flag.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn get(
    conn: &Connection,
    group_folder: &str,
    provider: &str,
) -> Result<Option<Capability>, StoreError> {
    let cap = conn
        .query_row(
            "SELECT * FROM capabilities WHERE group_folder = ?1 AND provider = ?2",
            params![group_folder, provider],
            |row| Ok(row_to_capability(row)),
        )
        .optional()?;
    cap.transpose()
}

/// Flips a grant inactive. Returns false when no grant existed.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn revoke(conn: &Connection, group_folder: &str, provider: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE capabilities SET active = 0 WHERE group_folder = ?1 AND provider = ?2",
        params![group_folder, provider],
    )?;
    Ok(changed > 0)
}

/// Lists all grants, sorted by group then provider.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure or corrupt rows.
pub fn list(conn: &Connection) -> Result<Vec<Capability>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT * FROM capabilities ORDER BY group_folder ASC, provider ASC")?;
    let rows = stmt.query_map([], |row| Ok(row_to_capability(row)))?;
    let mut caps = Vec::new();
    for row in rows {
        caps.push(row??);
    }
    Ok(caps)
}

/// Records one approval backing an L3 grant.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn record_grant_approval(
    conn: &Connection,
    group_folder: &str,
    provider: &str,
    approved_by: &str,
    created_at: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO capability_approvals (group_folder, provider, approved_by, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![group_folder, provider, approved_by, created_at],
    )?;
    Ok(())
}

/// Lists the distinct groups that approved a grant.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn grant_approver_groups(
    conn: &Connection,
    group_folder: &str,
    provider: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT approved_by FROM capability_approvals
         WHERE group_folder = ?1 AND provider = ?2 ORDER BY approved_by",
    )?;
    let rows = stmt.query_map(params![group_folder, provider], |row| row.get(0))?;
    let mut groups = Vec::new();
    for row in rows {
        groups.push(row?);
    }
    Ok(groups)
}
