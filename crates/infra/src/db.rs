//! SQLite connection setup and schema migration.
//!
//! Several worker processes open the same database file, so the pool runs in
//! WAL mode with a busy timeout. Timestamps are stored as RFC 3339 text at
//! whole-second precision, which makes lexical comparison in SQL agree with
//! chronological comparison.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use queuectl_core::{QueueError, QueueResult, truncate_to_second};

use crate::settings::{BACKOFF_BASE, DEFAULT_BACKOFF_BASE_VALUE, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES_VALUE};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) the queue database at `path` and migrate it.
pub async fn connect(path: &Path) -> QueueResult<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            QueueError::storage(format!("failed to create data directory {}: {e}", parent.display()))
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    migrate(&pool).await?;
    info!(path = %path.display(), "queue database ready");
    Ok(pool)
}

/// Create tables if missing, add columns older databases lack, seed settings.
pub async fn migrate(pool: &SqlitePool) -> QueueResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT PRIMARY KEY,
            command     TEXT NOT NULL,
            state       TEXT NOT NULL DEFAULT 'pending',
            attempts    INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            locked_by   TEXT,
            locked_at   TEXT,
            next_run_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("create_jobs_table", e))?;

    ensure_column(pool, "jobs", "started_at", "started_at TEXT").await?;
    ensure_column(pool, "jobs", "finished_at", "finished_at TEXT").await?;
    ensure_column(pool, "jobs", "duration_ms", "duration_ms INTEGER DEFAULT NULL").await?;
    ensure_column(pool, "jobs", "priority", "priority INTEGER NOT NULL DEFAULT 0").await?;
    ensure_column(pool, "jobs", "timeout_seconds", "timeout_seconds INTEGER DEFAULT NULL").await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS jobs_dispatch_idx
            ON jobs (state, priority DESC, next_run_at, created_at)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("create_dispatch_index", e))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("create_config_table", e))?;

    for (key, value) in [
        (BACKOFF_BASE, DEFAULT_BACKOFF_BASE_VALUE),
        (DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES_VALUE),
    ] {
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("seed_config", e))?;
    }

    Ok(())
}

async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, ddl: &str) -> QueueResult<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await
        .map_err(|e| map_sqlx_error("table_info", e))?;

    let mut found = false;
    for row in rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| map_sqlx_error("table_info", e))?;
        if name == column {
            found = true;
            break;
        }
    }

    if !found {
        debug!(table, column, "adding missing column");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {ddl}"))
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("add_column", e))?;
    }
    Ok(())
}

/// Canonical persisted form of a timestamp.
pub fn format_ts(at: DateTime<Utc>) -> String {
    truncate_to_second(at).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(raw: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| truncate_to_second(dt.with_timezone(&Utc)))
        .map_err(|e| QueueError::storage(format!("invalid timestamp {raw:?} in database: {e}")))
}

pub fn parse_opt_ts(raw: Option<String>) -> QueueResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Map SQLx errors to `QueueError`.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QueueError::storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::storage(format!("timed out waiting for a connection in {operation}"))
        }
        _ => QueueError::storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// SQLite primary-key (1555) or unique (2067) constraint failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.is_unique_violation() {
            return true;
        }
        if let Some(code) = db_err.code() {
            return matches!(code.as_ref(), "1555" | "2067");
        }
    }
    false
}
