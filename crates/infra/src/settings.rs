//! Key-value queue settings (`backoff_base`, `default_max_retries`).
//!
//! Values are strings, read on every use with no caching, so a change made by
//! `queuectl config set` takes effect on the next failure a worker handles.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use queuectl_core::job::DEFAULT_MAX_RETRIES as FALLBACK_MAX_RETRIES;
use queuectl_core::retry::DEFAULT_BACKOFF_BASE;
use queuectl_core::{QueueError, QueueResult, RetryPolicy};

use crate::db::map_sqlx_error;

pub const BACKOFF_BASE: &str = "backoff_base";
pub const DEFAULT_MAX_RETRIES: &str = "default_max_retries";

pub const DEFAULT_BACKOFF_BASE_VALUE: &str = "2";
pub const DEFAULT_MAX_RETRIES_VALUE: &str = "3";

/// String-valued settings store.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> QueueResult<()>;

    /// All settings ordered by key.
    async fn all(&self) -> QueueResult<Vec<(String, String)>>;

    /// Retry policy built from the current `backoff_base`.
    ///
    /// Missing or unusable values fall back to the default base.
    async fn retry_policy(&self) -> QueueResult<RetryPolicy> {
        let raw = self.get(BACKOFF_BASE).await?;
        Ok(parse_backoff_base(raw.as_deref()))
    }

    /// Retry ceiling applied to submissions that do not carry one.
    async fn default_max_retries(&self) -> QueueResult<u32> {
        let raw = self.get(DEFAULT_MAX_RETRIES).await?;
        Ok(parse_default_max_retries(raw.as_deref()))
    }
}

fn parse_backoff_base(raw: Option<&str>) -> RetryPolicy {
    let Some(raw) = raw else {
        return RetryPolicy::default();
    };
    match raw.trim().parse::<f64>() {
        Ok(base) => RetryPolicy::with_base(base).unwrap_or_else(|err| {
            warn!(value = raw, error = %err, "ignoring backoff_base setting");
            RetryPolicy::default()
        }),
        Err(_) => {
            warn!(value = raw, default = DEFAULT_BACKOFF_BASE, "backoff_base is not a number");
            RetryPolicy::default()
        }
    }
}

fn parse_default_max_retries(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return FALLBACK_MAX_RETRIES;
    };
    raw.trim().parse::<u32>().unwrap_or_else(|_| {
        warn!(value = raw, default = FALLBACK_MAX_RETRIES, "default_max_retries is not a non-negative integer");
        FALLBACK_MAX_RETRIES
    })
}

/// Settings stored in the `config` table of the queue database.
#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_config", e))?;
        match row {
            Some(row) => row
                .try_get::<Option<String>, _>("value")
                .map_err(|e| map_sqlx_error("get_config", e)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> QueueResult<()> {
        if key.trim().is_empty() {
            return Err(QueueError::config("config key must not be empty"));
        }
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_config", e))?;
        Ok(())
    }

    async fn all(&self) -> QueueResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_config", e))?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let value: Option<String> = row.try_get("value")?;
                Ok((key, value.unwrap_or_default()))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("list_config", e))
    }
}

/// In-memory settings, seeded with the same defaults as the database.
#[derive(Debug)]
pub struct InMemorySettingsStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl Default for InMemorySettingsStore {
    fn default() -> Self {
        let mut values = BTreeMap::new();
        values.insert(BACKOFF_BASE.to_string(), DEFAULT_BACKOFF_BASE_VALUE.to_string());
        values.insert(DEFAULT_MAX_RETRIES.to_string(), DEFAULT_MAX_RETRIES_VALUE.to_string());
        Self {
            values: RwLock::new(values),
        }
    }
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| QueueError::config("settings lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> QueueResult<()> {
        if key.trim().is_empty() {
            return Err(QueueError::config("config key must not be empty"));
        }
        let mut values = self
            .values
            .write()
            .map_err(|_| QueueError::config("settings lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn all(&self) -> QueueResult<Vec<(String, String)>> {
        let values = self
            .values
            .read()
            .map_err(|_| QueueError::config("settings lock poisoned"))?;
        Ok(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
