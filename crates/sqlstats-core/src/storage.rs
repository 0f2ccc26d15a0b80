//! SQLite storage shared by every node.
//!
//! One database file holds cluster settings, schedule metadata, job run
//! history and the two persisted statistics tables. Every node opens its own
//! connections to the same file; writers serialize on SQLite's write lock and
//! wait up to the configured busy timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{Error, Result, StorageError};

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Full schema. Every statement is idempotent.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS settings (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settings_meta (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    version INTEGER NOT NULL
);

INSERT OR IGNORE INTO settings_meta (id, version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    schedule_id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_name TEXT NOT NULL,
    executor_type TEXT NOT NULL,
    owner TEXT NOT NULL,
    schedule_expr TEXT NOT NULL,
    next_run INTEGER,
    last_run INTEGER,
    schedule_status TEXT NOT NULL
        CHECK(schedule_status IN ('pending', 'paused', 'succeeded', 'failed')),
    status_message TEXT,
    claimed_by TEXT,
    claim_expires_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_scheduled_jobs_name
    ON scheduled_jobs(schedule_name);

CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run
    ON scheduled_jobs(next_run);

CREATE TABLE IF NOT EXISTS job_runs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL
        REFERENCES scheduled_jobs(schedule_id) ON DELETE CASCADE,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('running', 'succeeded', 'failed')),
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    message TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_runs_schedule
    ON job_runs(schedule_id, started_at);

CREATE TABLE IF NOT EXISTS statement_statistics (
    aggregated_ts INTEGER NOT NULL,
    fingerprint_id TEXT NOT NULL,
    transaction_fingerprint_id TEXT NOT NULL,
    plan_hash TEXT NOT NULL,
    app_name TEXT NOT NULL,
    node_id INTEGER NOT NULL,
    agg_interval_secs INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    statistics TEXT NOT NULL,
    PRIMARY KEY (aggregated_ts, fingerprint_id, transaction_fingerprint_id, plan_hash, app_name, node_id)
);

CREATE INDEX IF NOT EXISTS idx_statement_statistics_aggregated_ts
    ON statement_statistics(aggregated_ts);

CREATE TABLE IF NOT EXISTS transaction_statistics (
    aggregated_ts INTEGER NOT NULL,
    fingerprint_id TEXT NOT NULL,
    app_name TEXT NOT NULL,
    node_id INTEGER NOT NULL,
    agg_interval_secs INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    statistics TEXT NOT NULL,
    PRIMARY KEY (aggregated_ts, fingerprint_id, app_name, node_id)
);

CREATE INDEX IF NOT EXISTS idx_transaction_statistics_aggregated_ts
    ON transaction_statistics(aggregated_ts);
";

/// Create or verify the schema on an open connection.
///
/// # Errors
/// Returns [`StorageError::SchemaTooNew`] when the file was written by a
/// newer version, or any SQLite error raised while applying the schema.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    conn.execute_batch(SCHEMA_SQL)?;
    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!(from = current, to = SCHEMA_VERSION, "Schema initialized");
    }
    Ok(())
}

/// Handle to the shared database file.
///
/// Cheap to clone. Each [`Database::call`] opens a fresh connection on the
/// blocking pool, so no connection is ever shared between tasks.
#[derive(Debug, Clone)]
pub struct Database {
    path: Arc<PathBuf>,
    busy_timeout: Duration,
}

impl Database {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: Arc::new(path.into()),
            busy_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.db_path.clone(),
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection with the standard PRAGMAs applied.
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(self.path.as_path())?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    /// Create the parent directory and schema if needed.
    pub fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        initialize_schema(&conn)
    }

    /// Run `f` on a fresh connection inside `spawn_blocking`.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.open()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Runtime(format!("storage task join error: {e}")))?
    }
}

/// Encode a timestamp for storage.
#[must_use]
pub fn to_epoch_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Decode a stored timestamp. Out-of-range values decode as `None`.
#[must_use]
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Decode a stored non-null timestamp column, failing the row on garbage.
pub(crate) fn required_ts(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    from_epoch_ms(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

#[cfg(test)]
pub(crate) fn make_test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    initialize_schema(&conn).unwrap();
    conn
}
