//! Persistent store backed by `SQLite`.
//!
//! All writes flow through a single `Arc<Mutex<Connection>>`: the mutex
//! serializes writers, WAL mode lets readers proceed against the last
//! committed snapshot, and foreign keys are enforced at the database
//! level. Every governance command runs inside one transaction taken on
//! the locked connection, so a failed pre-check leaves the file
//! byte-identical.
//!
//! Entity queries live in the submodules as free functions over
//! `&rusqlite::Connection`, which makes them usable both inside a
//! transaction (via `Deref`) and for plain reads.

pub mod activities;
pub mod approvals;
pub mod capabilities;
pub mod chat;
pub mod ext_calls;
pub mod notifications;
pub mod products;
pub mod tasks;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;

/// Filename of the database inside the store directory.
pub const DB_FILENAME: &str = "opsd.db";

/// Errors produced by the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The writer mutex was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// A stored value failed to parse back into its domain type.
    #[error("corrupt row: {message}")]
    Corrupt {
        /// What failed to parse.
        message: String,
    },

    /// Filesystem error while preparing the store directory.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}

/// Handle to the embedded database.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the database under `store_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the directory cannot be created or the
    /// database fails to open or migrate.
    pub fn open(store_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(store_dir)?;
        let conn = Connection::open(store_dir.join(DB_FILENAME))?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store. Test use only; nothing persists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when schema initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        configure(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the single writer connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] when a previous holder
    /// panicked.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Runs a read-only closure on the connection.
    ///
    /// # Errors
    ///
    /// Propagates lock poisoning and whatever the closure returns.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.lock()?;
        f(&conn)
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    Ok(())
}

/// Creates all tables and indexes. Idempotent.
///
/// # Errors
///
/// Returns the underlying `SQLite` error on DDL failure.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            risk_level TEXT NOT NULL DEFAULT 'normal',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            task_type TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'INBOX',
            priority TEXT NOT NULL DEFAULT 'P2',
            scope TEXT NOT NULL DEFAULT 'COMPANY',
            product_id TEXT REFERENCES products(id),
            assigned_group TEXT NOT NULL,
            executor TEXT,
            created_by TEXT NOT NULL,
            gate TEXT NOT NULL DEFAULT 'None',
            dod_required INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
        CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks(assigned_group);

        CREATE TABLE IF NOT EXISTS activities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            action TEXT NOT NULL,
            from_state TEXT,
            to_state TEXT,
            actor TEXT NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activities_task ON activities(task_id);

        CREATE TABLE IF NOT EXISTS approvals (
            task_id TEXT NOT NULL REFERENCES tasks(id),
            gate_type TEXT NOT NULL,
            approved_by TEXT NOT NULL,
            notes TEXT,
            evidence_link TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (task_id, gate_type)
        );

        CREATE TABLE IF NOT EXISTS capabilities (
            group_folder TEXT NOT NULL,
            provider TEXT NOT NULL,
            access_level INTEGER NOT NULL,
            allowed_actions TEXT,
            denied_actions TEXT,
            granted_by TEXT NOT NULL,
            granted_at TEXT NOT NULL,
            expires_at TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (group_folder, provider)
        );

        CREATE TABLE IF NOT EXISTS capability_approvals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_folder TEXT NOT NULL,
            provider TEXT NOT NULL,
            approved_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_capability_approvals_grant
            ON capability_approvals(group_folder, provider);

        CREATE TABLE IF NOT EXISTS ext_calls (
            request_id TEXT PRIMARY KEY,
            group_folder TEXT NOT NULL,
            provider TEXT NOT NULL,
            action TEXT NOT NULL,
            access_level INTEGER NOT NULL,
            params_hmac TEXT NOT NULL,
            params_summary TEXT NOT NULL,
            status TEXT NOT NULL,
            denial_reason TEXT,
            result_summary TEXT,
            response_data TEXT,
            task_id TEXT REFERENCES tasks(id),
            product_id TEXT,
            idempotency_key TEXT,
            duration_ms INTEGER,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ext_calls_group_status
            ON ext_calls(group_folder, status);
        CREATE INDEX IF NOT EXISTS idx_ext_calls_idempotency
            ON ext_calls(idempotency_key, provider, action);

        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            target_group TEXT NOT NULL,
            actor TEXT NOT NULL,
            snippet TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_target
            ON notifications(target_group, read);

        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            group_folder TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            last_activity TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_topics_group ON topics(group_folder);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id TEXT REFERENCES topics(id),
            group_folder TEXT NOT NULL,
            sender TEXT NOT NULL,
            text TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);
        ",
    )
}
