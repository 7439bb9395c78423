//! Command implementations. Each writes its result to `out`, as a table or JSON.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use queuectl_core::{Clock, Job, JobId, JobRequest, JobState, QueueError, RetryPolicy, SystemClock, WorkerId};
use queuectl_infra::config::QueueConfig;
use queuectl_infra::db;
use queuectl_infra::exec::ShellRunner;
use queuectl_infra::jobs::{self, JobStore, SqliteJobStore};
use queuectl_infra::settings::{BACKOFF_BASE, DEFAULT_MAX_RETRIES, SettingsStore, SqliteSettingsStore};
use queuectl_infra::workers::{
    ProcessControl, ShutdownHandle, Worker, WorkerConfig, WorkerStats, WorkerSupervisor, shutdown_channel,
};

use crate::cli::EnqueueArgs;

/// Open stores over the configured database.
pub struct Queue {
    pub config: QueueConfig,
    pub store: SqliteJobStore,
    pub settings: SqliteSettingsStore,
}

impl Queue {
    pub async fn open(config: QueueConfig) -> anyhow::Result<Self> {
        let pool = db::connect(&config.database_path)
            .await
            .with_context(|| format!("cannot open queue database {}", config.database_path.display()))?;
        Ok(Self {
            config,
            store: SqliteJobStore::new(pool.clone()),
            settings: SqliteSettingsStore::new(pool),
        })
    }
}

fn write_json<T: Serialize>(out: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Build a submission from either a JSON document or individual flags.
pub fn build_request(args: EnqueueArgs, stdin: &mut dyn Read) -> anyhow::Result<JobRequest> {
    if let Some(raw) = args.job {
        let raw = if raw == "-" {
            let mut buf = String::new();
            stdin.read_to_string(&mut buf).context("failed to read job JSON from stdin")?;
            buf
        } else {
            raw
        };
        return Ok(JobRequest::from_json(&raw)?);
    }

    Ok(JobRequest {
        id: args.id,
        command: args.command,
        max_retries: args.max_retries,
        priority: args.priority,
        run_at: args.run_at.map(queuectl_core::job::RunAt::Text),
        timeout_seconds: args.timeout,
        ..Default::default()
    })
}

pub async fn enqueue(queue: &Queue, request: JobRequest, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let job = jobs::submit(&queue.store, &queue.settings, request, &SystemClock).await?;
    if json {
        return write_json(out, &job);
    }
    writeln!(out, "Enqueued job {} (max_retries {}, priority {})", job.id, job.max_retries, job.priority)?;
    Ok(())
}

fn write_jobs(out: &mut dyn Write, jobs: &[Job]) -> anyhow::Result<()> {
    if jobs.is_empty() {
        writeln!(out, "No jobs.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<40} {:<10} {:>8} {:>8} {:<20} COMMAND",
        "ID", "STATE", "ATTEMPTS", "PRIORITY", "NEXT RUN"
    )?;
    for job in jobs {
        let next_run = job
            .next_run_at
            .map(|at| at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{:<40} {:<10} {:>8} {:>8} {:<20} {}",
            job.id.as_str(),
            job.state.as_str(),
            format!("{}/{}", job.attempts, job.max_retries),
            job.priority,
            next_run,
            job.command
        )?;
    }
    Ok(())
}

pub async fn list(queue: &Queue, state: Option<JobState>, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let jobs = queue.store.list_by_state(state).await?;
    if json {
        return write_json(out, &jobs);
    }
    write_jobs(out, &jobs)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    jobs: jobs::JobStats,
    active_workers: Vec<u32>,
}

pub async fn status(queue: &Queue, active_workers: Vec<u32>, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let report = StatusReport {
        jobs: queue.store.stats().await?,
        active_workers,
    };
    if json {
        return write_json(out, &report);
    }
    let s = &report.jobs;
    for (label, count) in [
        ("pending", s.pending),
        ("processing", s.processing),
        ("completed", s.completed),
        ("failed", s.failed),
        ("dead", s.dead),
    ] {
        writeln!(out, "{label:<11} {count}")?;
    }
    writeln!(out, "{:<11} {}", "total", s.total())?;
    if report.active_workers.is_empty() {
        writeln!(out, "Active workers: none")?;
    } else {
        let pids: Vec<String> = report.active_workers.iter().map(u32::to_string).collect();
        writeln!(out, "Active workers: {}", pids.join(", "))?;
    }
    Ok(())
}

pub async fn metrics(queue: &Queue, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let metrics = queue.store.metrics().await?;
    if json {
        return write_json(out, &metrics);
    }
    let fmt_f = |v: Option<f64>| v.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string());
    let fmt_i = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
    writeln!(out, "Total jobs:        {}", metrics.total_jobs)?;
    writeln!(out, "Dead jobs:         {}", metrics.dead_jobs)?;
    writeln!(out, "Average attempts:  {}", fmt_f(metrics.avg_attempts))?;
    writeln!(out, "Completed (timed): {}", metrics.durations.completed_count)?;
    writeln!(out, "Duration avg ms:   {}", fmt_f(metrics.durations.avg_ms))?;
    writeln!(out, "Duration min ms:   {}", fmt_i(metrics.durations.min_ms))?;
    writeln!(out, "Duration max ms:   {}", fmt_i(metrics.durations.max_ms))?;
    Ok(())
}

pub async fn dlq_list(queue: &Queue, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    list(queue, Some(JobState::Dead), out, json).await
}

pub async fn dlq_retry(queue: &Queue, id: &str, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let job = queue
        .store
        .retry_dead_letter(&JobId::new(id), SystemClock.now())
        .await?;
    info!(job_id = %job.id, "dead job requeued");
    if json {
        return write_json(out, &job);
    }
    writeln!(out, "Job {} moved back to pending", job.id)?;
    Ok(())
}

/// Reject values workers would otherwise ignore with a warning.
fn validate_setting(key: &str, value: &str) -> Result<(), QueueError> {
    match key {
        BACKOFF_BASE => {
            let base: f64 = value
                .trim()
                .parse()
                .map_err(|_| QueueError::config(format!("{key} must be a number, got {value:?}")))?;
            RetryPolicy::with_base(base).map(|_| ())
        }
        DEFAULT_MAX_RETRIES => value.trim().parse::<u32>().map(|_| ()).map_err(|_| {
            QueueError::config(format!("{key} must be a non-negative integer, got {value:?}"))
        }),
        _ => Ok(()),
    }
}

pub async fn config_get(queue: &Queue, key: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    match queue.settings.get(key).await? {
        Some(value) => writeln!(out, "{value}")?,
        None => anyhow::bail!("config key {key:?} is not set"),
    }
    Ok(())
}

pub async fn config_set(queue: &Queue, key: &str, value: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    validate_setting(key, value)?;
    queue.settings.set(key, value).await?;
    writeln!(out, "{key} = {value}")?;
    Ok(())
}

pub async fn config_list(queue: &Queue, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let all = queue.settings.all().await?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = all
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        return write_json(out, &map);
    }
    for (key, value) in all {
        writeln!(out, "{key} = {value}")?;
    }
    Ok(())
}

pub async fn reap(queue: &Queue, older_than_secs: u64, out: &mut dyn Write, json: bool) -> anyhow::Result<()> {
    let older_than = i64::try_from(older_than_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .context("--older-than is out of range")?;
    let reclaimed = queue.store.reclaim_stale_leases(older_than, SystemClock.now()).await?;
    if json {
        return write_json(out, &reclaimed);
    }
    if reclaimed.is_empty() {
        writeln!(out, "No stale leases.")?;
    }
    for id in reclaimed {
        writeln!(out, "Reclaimed {id}")?;
    }
    Ok(())
}

pub fn worker_start<P: ProcessControl>(
    supervisor: &WorkerSupervisor<P>,
    count: usize,
    out: &mut dyn Write,
    json: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(count > 0, "--count must be at least 1");
    let spawned = supervisor.start(count)?;
    if json {
        return write_json(out, &spawned);
    }
    for pid in &spawned {
        writeln!(out, "Spawned worker pid {pid}")?;
    }
    if spawned.len() < count {
        writeln!(out, "{} of {count} workers failed to start", count - spawned.len())?;
    }
    Ok(())
}

pub fn worker_stop<P: ProcessControl>(
    supervisor: &WorkerSupervisor<P>,
    out: &mut dyn Write,
    json: bool,
) -> anyhow::Result<()> {
    let report = supervisor.stop()?;
    if json {
        return write_json(out, &report);
    }
    if report.signalled.is_empty() && report.failed.is_empty() {
        writeln!(out, "No workers recorded.")?;
    }
    for pid in &report.signalled {
        writeln!(out, "Sent SIGTERM to pid {pid}")?;
    }
    for (pid, err) in &report.failed {
        writeln!(out, "Failed to signal pid {pid}: {err}")?;
    }
    Ok(())
}

pub fn worker_list<P: ProcessControl>(
    supervisor: &WorkerSupervisor<P>,
    out: &mut dyn Write,
    json: bool,
) -> anyhow::Result<()> {
    let active = supervisor.list_active();
    if json {
        return write_json(out, &active);
    }
    if active.is_empty() {
        writeln!(out, "No active workers.")?;
    }
    for pid in active {
        writeln!(out, "{pid}")?;
    }
    Ok(())
}

/// Drain on SIGTERM or Ctrl-C.
fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination requested; finishing current job");
        handle.shutdown();
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "cannot install SIGTERM handler; only Ctrl-C will stop this worker");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Body of a worker process. Returns once a termination signal has drained it.
pub async fn run_worker(config: QueueConfig) -> anyhow::Result<WorkerStats> {
    let queue = Queue::open(config).await?;
    let worker = Worker::new(
        WorkerId::for_current_process(),
        Arc::new(queue.store),
        Arc::new(queue.settings),
        Arc::new(ShellRunner::new()),
        Arc::new(SystemClock),
        WorkerConfig::from(&queue.config),
    );
    let (handle, rx) = shutdown_channel();
    spawn_signal_listener(handle);
    Ok(worker.run(rx).await)
}
