//! Per-process worker loop: claim, execute, report, repeat.
//!
//! A worker is single-threaded and sequential. It suspends only while idle
//! (no eligible job) and while its command runs. Shutdown is observed between
//! jobs; a job that is already executing always runs to completion and is
//! reported before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use queuectl_core::{Clock, FailureDecision, Job, JobId, JobState, QueueError, QueueResult, WorkerId};

use crate::config::QueueConfig;
use crate::exec::{CommandRunner, ExecutionOutcome};
use crate::jobs::JobStore;
use crate::settings::SettingsStore;

/// Longest stdout/stderr excerpt written to the log per attempt.
const LOG_EXCERPT_CHARS: usize = 500;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after a claim found nothing.
    pub poll_interval: Duration,
    /// Sleep after an unexpected error inside an iteration.
    pub fault_backoff: Duration,
    /// Reclaim leases older than this between claims.
    pub lease_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fault_backoff: Duration::from_secs(1),
            lease_timeout: None,
        }
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            fault_backoff: config.fault_backoff(),
            lease_timeout: config.lease_timeout(),
        }
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub loop_faults: u64,
    pub leases_reclaimed: u64,
}

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing eligible.
    Idle,
    Completed(JobId),
    Retried {
        id: JobId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    DeadLettered {
        id: JobId,
        attempts: u32,
    },
    /// The job left this worker's lease while it ran (e.g. reclaimed as stale
    /// and claimed again); the report was dropped.
    LeaseLost(JobId),
}

/// Cloneable handle that asks a running worker to drain.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Set the draining flag. The current job, if any, still completes.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_draining(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Shutdown channel for one worker loop.
pub fn shutdown_channel() -> (ShutdownHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, rx)
}

/// One worker process's execution loop.
pub struct Worker {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    settings: Arc<dyn SettingsStore>,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stats: WorkerStats,
    last_sweep: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsStore>,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            store,
            settings,
            runner,
            clock,
            config,
            stats: WorkerStats::default(),
            last_sweep: None,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run until `shutdown` reads `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(worker = %self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.tick().await {
                Ok(TickOutcome::Idle) => Some(self.config.poll_interval),
                Ok(_) => None,
                Err(err) => {
                    self.stats.loop_faults += 1;
                    error!(worker = %self.id, error = %err, "worker loop fault");
                    Some(self.config.fault_backoff)
                }
            };

            if let Some(pause) = pause {
                if sleep_or_shutdown(&mut shutdown, pause).await {
                    break;
                }
            }
        }

        let stats = self.stats;
        info!(
            worker = %self.id,
            jobs_processed = stats.jobs_processed,
            jobs_succeeded = stats.jobs_succeeded,
            jobs_retried = stats.jobs_retried,
            jobs_dead_lettered = stats.jobs_dead_lettered,
            loop_faults = stats.loop_faults,
            leases_reclaimed = stats.leases_reclaimed,
            "worker drained and exiting"
        );
        stats
    }

    /// One loop iteration: optional lease sweep, claim, execute, report.
    ///
    /// Errors are store or settings faults. A failing command is not an error.
    pub async fn tick(&mut self) -> QueueResult<TickOutcome> {
        self.sweep_stale_leases().await?;

        let Some(job) = self.store.claim(&self.id, self.clock.now()).await? else {
            return Ok(TickOutcome::Idle);
        };
        info!(
            worker = %self.id,
            job_id = %job.id,
            command = %job.command,
            attempts = job.attempts,
            "claimed job"
        );

        let result = self.runner.run(&job.command, job.timeout()).await;
        self.stats.jobs_processed += 1;

        match result {
            Ok(outcome) if outcome.is_success() => self.report_success(&job, &outcome).await,
            Ok(outcome) => {
                let reason = if outcome.timed_out {
                    "timed out".to_string()
                } else {
                    match outcome.exit_code {
                        Some(code) => format!("exit code {code}"),
                        None => "terminated by signal".to_string(),
                    }
                };
                if !outcome.stderr.trim().is_empty() {
                    warn!(job_id = %job.id, stderr = %excerpt(&outcome.stderr), "command stderr");
                }
                self.report_failure(&job, &reason).await
            }
            Err(err) => self.report_failure(&job, &err.to_string()).await,
        }
    }

    async fn report_success(&mut self, job: &Job, outcome: &ExecutionOutcome) -> QueueResult<TickOutcome> {
        if !self.store.mark_completed(&job.id, &self.id, self.clock.now()).await? {
            warn!(worker = %self.id, job_id = %job.id, "lease lost before completion was recorded");
            return Ok(TickOutcome::LeaseLost(job.id.clone()));
        }
        self.stats.jobs_succeeded += 1;
        info!(
            worker = %self.id,
            job_id = %job.id,
            stdout = %excerpt(&outcome.stdout),
            "job completed"
        );
        Ok(TickOutcome::Completed(job.id.clone()))
    }

    async fn report_failure(&mut self, job: &Job, reason: &str) -> QueueResult<TickOutcome> {
        // Attempt counters come from the store, not from the claimed snapshot.
        let current = self
            .store
            .get_job(&job.id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;
        if current.state != JobState::Processing || current.locked_by.as_ref() != Some(&self.id) {
            warn!(worker = %self.id, job_id = %job.id, state = %current.state, "lease lost before failure was recorded");
            return Ok(TickOutcome::LeaseLost(job.id.clone()));
        }

        let policy = self.settings.retry_policy().await?;
        let now = self.clock.now();
        let decision = policy.decide(current.attempts, current.max_retries);

        match decision {
            FailureDecision::Retry { attempts, delay } => {
                let next_run_at = decision.next_run_at(now).unwrap_or(now);
                if !self
                    .store
                    .mark_failed_retryable(&job.id, &self.id, attempts, next_run_at, now)
                    .await?
                {
                    return Ok(TickOutcome::LeaseLost(job.id.clone()));
                }
                self.stats.jobs_retried += 1;
                warn!(
                    worker = %self.id,
                    job_id = %job.id,
                    reason,
                    attempts,
                    max_retries = current.max_retries,
                    retry_in_secs = delay.as_secs_f64(),
                    "job failed; retry scheduled"
                );
                Ok(TickOutcome::Retried {
                    id: job.id.clone(),
                    attempts,
                    next_run_at,
                })
            }
            FailureDecision::Dead { attempts } => {
                if !self.store.mark_dead(&job.id, &self.id, attempts, now).await? {
                    return Ok(TickOutcome::LeaseLost(job.id.clone()));
                }
                self.stats.jobs_dead_lettered += 1;
                error!(
                    worker = %self.id,
                    job_id = %job.id,
                    reason,
                    attempts,
                    max_retries = current.max_retries,
                    "job moved to dead letter queue"
                );
                Ok(TickOutcome::DeadLettered {
                    id: job.id.clone(),
                    attempts,
                })
            }
        }
    }

    /// At most once per lease timeout, return stale leases to `pending`.
    async fn sweep_stale_leases(&mut self) -> QueueResult<()> {
        let Some(lease_timeout) = self.config.lease_timeout else {
            return Ok(());
        };
        let lease_timeout = chrono::Duration::from_std(lease_timeout)
            .map_err(|_| QueueError::config("lease timeout out of range"))?;

        let now = self.clock.now();
        if let Some(last) = self.last_sweep {
            if now - last < lease_timeout {
                return Ok(());
            }
        }
        self.last_sweep = Some(now);

        let reclaimed = self.store.reclaim_stale_leases(lease_timeout, now).await?;
        for id in &reclaimed {
            warn!(worker = %self.id, job_id = %id, "reclaimed stale lease");
        }
        self.stats.leases_reclaimed += reclaimed.len() as u64;
        Ok(())
    }
}

/// Sleep for `pause` unless shutdown is requested first. Returns `true` when
/// the loop should exit.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= LOG_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(LOG_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}
