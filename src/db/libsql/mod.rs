//! libSQL backend for the storage traits.
//!
//! Embedded SQLite-compatible database using Turso's libSQL fork. Three
//! modes:
//! - Local embedded (file-based, no server needed)
//! - Remote replica (embedded file synced to a libSQL server)
//! - In-memory (for testing)
//!
//! All per-user mutations are single guarded statements (or one short
//! transaction for `complete`), so concurrent writers for the same user
//! serialize inside the database engine rather than around an in-process
//! read-then-write pair.

mod payments;
mod sessions;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};

use crate::db::libsql_migrations;
use crate::db::Database;
use crate::error::DatabaseError;

/// Explicit column list for the sessions table (matches positional access in
/// `row_to_session`).
pub(crate) const SESSION_COLUMNS: &str =
    "user_id, current_step, temp_data, step_history, last_error, created_at, last_updated";

/// Explicit column list for pending_payments (matches `row_to_payment`).
pub(crate) const PAYMENT_COLUMNS: &str =
    "track_id, user_id, conversation_id, amount, currency, status, kind, created_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    /// `:memory:` databases are connection-local, so the memory mode keeps
    /// one handle and clones it per operation; every caller must see the
    /// same data. File-backed modes open per-operation connections instead.
    shared_conn: Option<Connection>,
}

impl LibSqlBackend {
    /// Create a new local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to open libSQL database: {}", e))
            })?;

        Ok(Self {
            db: Arc::new(db),
            shared_conn: None,
        })
    }

    /// Create a new in-memory database (for testing).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {}", e))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to set busy_timeout: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            shared_conn: Some(conn),
        })
    }

    /// Create with remote sync (embedded replica).
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open remote replica: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            shared_conn: None,
        })
    }

    /// Get a connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every fresh connection so
    /// concurrent writers wait up to 5 seconds instead of failing instantly
    /// with "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        if let Some(conn) = &self.shared_conn {
            return Ok(conn.clone());
        }
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        // WAL mode persists in the database file: readers no longer block
        // writers and vice versa.
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to enable WAL mode: {}", e)))?;
        conn.execute_batch(libsql_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }
}

// ==================== Helper functions ====================

/// Parse an ISO-8601 timestamp string from SQLite into DateTime<Utc>.
///
/// Accepts RFC 3339 (the canonical write format) and the naive datetime
/// forms SQLite's own datetime() emits.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// Format a DateTime<Utc> for storage (RFC 3339, millisecond precision).
///
/// Fixed-width UTC output, so lexicographic string comparison in SQL matches
/// chronological order; the TTL sweep's `last_updated < cutoff` relies on it.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Extract a text column, returning empty string for NULL.
pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column. Returns None for SQL NULL.
pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Extract an i64 column, defaulting to 0.
pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

/// Parse a timestamp from a text column.
///
/// If the column is NULL or unparseable, logs a warning and returns the Unix
/// epoch so the bad value is detectable rather than silently replaced by the
/// current time.
pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    match row.get::<String>(idx) {
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => dt,
            Err(e) => {
                tracing::warn!("Timestamp parse failure at column {}: {}", idx, e);
                DateTime::UNIX_EPOCH
            }
        },
        Err(_) => DateTime::UNIX_EPOCH,
    }
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}
