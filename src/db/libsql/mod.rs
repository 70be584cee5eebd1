//! libSQL backend for the Database trait.
//!
//! Embedded SQLite-compatible storage via Turso's libSQL fork. Two modes:
//! - Local embedded (file-based, no server needed)
//! - In-memory (for testing)

mod checkpoints;
mod consent;
mod plans;
mod reservations;
mod tickets;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use uuid::Uuid;

use crate::db::{Database, migrations};
use crate::error::DatabaseError;

/// libSQL database backend.
///
/// The `Database` handle lives in an `Arc` so connections can be created
/// per-operation against the same underlying database.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    // Keeps the shared-cache in-memory database alive for the backend's
    // lifetime. A shared-cache `:memory:` database is destroyed once its last
    // connection closes, so without a held-open connection the schema would
    // vanish between per-operation `connect()` calls. `None` for file-backed
    // databases, which persist on disk regardless.
    _keepalive: Option<Connection>,
}

impl LibSqlBackend {
    /// Create a new local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            _keepalive: None,
        })
    }

    /// Create a new in-memory database (for testing).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        // A bare `:memory:` database is connection-local: every `connect()`
        // opens a fresh, empty database, so migrations run on one connection
        // are invisible to the next. Use a uniquely-named shared-cache
        // in-memory database instead, so all connections from this backend
        // share one database while staying isolated from other backends.
        let uri = format!("file:memdb-{}?mode=memory&cache=shared", Uuid::new_v4());
        let db = libsql::Builder::new_local(uri)
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {}", e))
            })?;

        let keepalive = db.connect().map_err(|e| {
            DatabaseError::Pool(format!("Failed to open in-memory keepalive connection: {}", e))
        })?;

        Ok(Self {
            db: Arc::new(db),
            _keepalive: Some(keepalive),
        })
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait up to 5 seconds instead of failing instantly with
    /// "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {}", e)))?;
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
        conn.execute_batch(migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }
}

// ==================== Row helpers ====================

/// Parse an ISO-8601 timestamp string from SQLite into DateTime<Utc>.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    // RFC 3339 (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Naive datetime (SQLite datetime() output)
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// Format a DateTime<Utc> for SQLite storage (RFC 3339, millisecond
/// precision, always UTC). Fixed-width, so lexicographic comparison in SQL
/// matches chronological order.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Format an optional DateTime<Utc>.
pub(crate) fn fmt_opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Extract a text column, returning empty string for NULL.
pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column. Returns None for SQL NULL.
pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Extract an i64 column, defaulting to 0.
pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

/// Parse a JSON value from a text column.
pub(crate) fn get_json(row: &libsql::Row, idx: i32) -> serde_json::Value {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

/// Parse an optional JSON value from a text column.
pub(crate) fn get_opt_json(row: &libsql::Row, idx: i32) -> Option<serde_json::Value> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Parse a required uuid from a text column.
pub(crate) fn get_uuid(row: &libsql::Row, idx: i32) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(&get_text(row, idx)).map_err(|e| DatabaseError::Query(e.to_string()))
}

/// Parse an optional uuid from a text column.
pub(crate) fn get_opt_uuid(row: &libsql::Row, idx: i32) -> Result<Option<Uuid>, DatabaseError> {
    match get_opt_text(row, idx) {
        Some(text) => Ok(Some(
            Uuid::parse_str(&text).map_err(|e| DatabaseError::Query(e.to_string()))?,
        )),
        None => Ok(None),
    }
}

/// Parse a timestamp from a text column.
///
/// If the column is NULL or unparseable, logs a warning and returns the Unix
/// epoch so the error is detectable rather than silently replaced by now.
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

/// Parse an optional timestamp from a text column.
pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    match row.get::<String>(idx) {
        Ok(s) if s.is_empty() => None,
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => Some(dt),
            Err(e) => {
                tracing::warn!("Timestamp parse failure at column {}: {}", idx, e);
                None
            }
        },
        Err(_) => None,
    }
}
