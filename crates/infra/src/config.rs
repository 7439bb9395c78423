//! Runtime configuration for queue processes.
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `QUEUECTL_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

use queuectl_observability::LogFormat;

/// Default location of the optional config file.
pub const CONFIG_FILE: &str = "queuectl.toml";

/// Environment variable naming an alternative config file.
pub const CONFIG_FILE_ENV: &str = "QUEUECTL_CONFIG";

/// Upper bound for `lease_timeout_secs` (one year).
pub const MAX_LEASE_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite database shared by every queue process.
    pub database_path: PathBuf,
    /// Directory holding the worker pid registry.
    pub runtime_dir: PathBuf,
    /// Idle sleep between empty claims.
    pub poll_interval_ms: u64,
    /// Sleep after an unexpected loop error.
    pub fault_backoff_ms: u64,
    /// When set, workers return leases older than this to `pending`.
    pub lease_timeout_secs: Option<u64>,
    pub log_format: LogFormat,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/queue.db"),
            runtime_dir: PathBuf::from("runtime"),
            poll_interval_ms: 1000,
            fault_backoff_ms: 1000,
            lease_timeout_secs: None,
            log_format: LogFormat::Json,
        }
    }
}

impl QueueConfig {
    /// Load configuration from the config file and environment.
    ///
    /// # Errors
    ///
    /// Returns error if a provided value cannot be parsed.
    pub fn load() -> anyhow::Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        Self::load_from(&file)
    }

    /// Load with an explicit config file path. A missing file is skipped.
    pub fn load_from(file: &Path) -> anyhow::Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed("QUEUECTL_").ignore(&["config"]));
        Self::from_figment(figment)
            .with_context(|| format!("failed to load configuration (file {})", file.display()))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.database_path.as_os_str().is_empty(),
            "database_path must not be empty"
        );
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        if let Some(secs) = self.lease_timeout_secs {
            anyhow::ensure!(secs > 0, "lease_timeout_secs must be positive when set");
            anyhow::ensure!(
                secs <= MAX_LEASE_TIMEOUT_SECS,
                "lease_timeout_secs must be at most {MAX_LEASE_TIMEOUT_SECS}"
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout_secs.map(Duration::from_secs)
    }

    /// Location of the worker pid registry.
    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("workers.json")
    }
}
