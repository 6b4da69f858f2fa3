//! Storage layer for sessionizer.
//!
//! One SQLite file backs both the device event logs and the workflow journal,
//! so several processes pointed at the same file share a single store.
//!
//! # Concurrency
//!
//! [`Database`] keeps one `rusqlite::Connection` behind a shared mutex, which
//! makes a handle `Sync` and cheap to clone, and lets it be shared as
//! `Arc<dyn EventLog>` and `Arc<dyn Journal>`. The synchronous methods block
//! the calling thread, for up to the busy timeout under contention; the
//! async trait implementations run them on tokio's blocking pool so runtime
//! workers never wait on SQLite. Cross-handle and cross-process exclusion comes from
//! SQLite itself: the claim and lease operations run in `IMMEDIATE`
//! transactions, and a busy timeout makes competing writers wait instead of
//! failing outright. A writer that still cannot get the lock surfaces as an
//! `Unavailable` error, which callers treat as transient.
//!
//! # Schema
//!
//! ## `device_logs`
//!
//! One row per appended value. `seq` is the global append order; a key's log
//! is its rows ordered by `seq`. A key exists exactly while it has rows.
//!
//! ## `workflows` / `workflow_steps`
//!
//! Journal rows. Timestamps are stored as TEXT in RFC 3339 with fixed
//! microsecond precision (e.g. `2025-01-15T10:30:00.000000Z`) so that
//! lexicographic order matches chronological order.

mod event_log;
mod journal;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use sz_core::{JournalError, StoreError};
use thiserror::Error;

pub use event_log::LogSummary;

/// How long a writer waits on another connection's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored JSON column could not be read back.
    #[error("invalid {column} for workflow {workflow_id}: {source}")]
    Json {
        workflow_id: String,
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp for workflow {workflow_id}: {value}")]
    TimestampParse {
        workflow_id: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored workflow status is not one we know.
    #[error("invalid status for workflow {workflow_id}: {value}")]
    InvalidStatus { workflow_id: String, value: String },
    /// A blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DbError {
    /// Whether the failure is lock contention or an unreachable file, as
    /// opposed to a broken query or corrupt row.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
            ),
            _ => false,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        if err.is_unavailable() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<DbError> for JournalError {
    fn from(err: DbError) -> Self {
        if err.is_unavailable() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Database connection wrapper.
///
/// Clones share the connection. See the [module documentation](self) for
/// concurrency considerations.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` against a clone of this handle on the blocking thread pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, DbError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db)).await?
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            -- Device logs: one row per appended value
            -- key: '<namespace>:<device>'
            -- value: RFC 3339 UTC timestamp as written by ingestion
            CREATE TABLE IF NOT EXISTS device_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_device_logs_key ON device_logs(key, seq);

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                detail TEXT,
                owner TEXT,
                lease_until TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status, created_at);

            CREATE TABLE IF NOT EXISTS workflow_steps (
                workflow_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                output TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, step_index),
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str, workflow_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            workflow_id: workflow_id.to_string(),
            value: value.to_string(),
            source,
        })
}
