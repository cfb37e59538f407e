//! Topic and chat message queries.

use opsd_core::record::{ChatMessage, Topic};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;

fn row_to_topic(row: &Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        title: row.get("title")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        last_activity: row.get("last_activity")?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get("id")?,
        topic_id: row.get("topic_id")?,
        group_folder: row.get("group_folder")?,
        sender: row.get("sender")?,
        text: row.get("text")?,
        timestamp: row.get("timestamp")?,
    })
}

/// Inserts a topic row.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn insert_topic(conn: &Connection, topic: &Topic) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO topics (id, group_folder, title, status, created_at, last_activity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            topic.id,
            topic.group_folder,
            topic.title,
            topic.status,
            topic.created_at,
            topic.last_activity,
        ],
    )?;
    Ok(())
}

/// Fetches one topic by id.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn get_topic(conn: &Connection, id: &str) -> Result<Option<Topic>, StoreError> {
    let topic = conn
        .query_row("SELECT * FROM topics WHERE id = ?1", params![id], row_to_topic)
        .optional()?;
    Ok(topic)
}

/// Lists a group's topics, most recently active first.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn list_topics(conn: &Connection, group_folder: &str) -> Result<Vec<Topic>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM topics WHERE group_folder = ?1 ORDER BY last_activity DESC",
    )?;
    let rows = stmt.query_map(params![group_folder], row_to_topic)?;
    let mut topics = Vec::new();
    for row in rows {
        topics.push(row?);
    }
    Ok(topics)
}

/// Inserts a message row, updating the owning topic's `last_activity`
/// when the message is topic-bound.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn insert_message(conn: &Connection, message: &ChatMessage) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO messages (topic_id, group_folder, sender, text, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.topic_id,
            message.group_folder,
            message.sender,
            message.text,
            message.timestamp,
        ],
    )?;
    if let Some(topic_id) = &message.topic_id {
        conn.execute(
            "UPDATE topics SET last_activity = ?2 WHERE id = ?1",
            params![topic_id, message.timestamp],
        )?;
    }
    Ok(conn.last_insert_rowid())
}

/// Lists messages ascending by timestamp, optionally only those strictly
/// before the given timestamp.
///
/// # Errors
///
/// Returns [`StoreError`] on SQL failure.
pub fn list_messages(
    conn: &Connection,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<ChatMessage>, StoreError> {
    // Page backwards from `before`, then flip to ascending order.
    let mut messages = if let Some(before) = before {
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE timestamp < ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![before, limit], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        let mut stmt =
            conn.prepare("SELECT * FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    messages.reverse();
    Ok(messages)
}
