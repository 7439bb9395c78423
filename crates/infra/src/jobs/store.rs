//! Job store abstraction.
//!
//! The store is the sole source of truth for job state. Every transition out of
//! `processing` is a conditional write guarded by `state = 'processing'` and by
//! the reporting worker still holding the lease. The claim itself is a
//! conditional write guarded by `state = 'pending'`, so any number of workers
//! can share one store without double-executing a job.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use queuectl_core::{Job, JobId, JobPatch, JobState, NewJob, QueueError, QueueResult, WorkerId};

/// Durable collection of job records keyed by id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job. Fails with `DuplicateJob` if the id exists.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job>;

    /// Point lookup.
    async fn get_job(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// All jobs, optionally filtered by state, ordered by `created_at` ascending.
    async fn list_by_state(&self, state: Option<JobState>) -> QueueResult<Vec<Job>>;

    /// Merge `patch` into the record. Fails with `NotFound` for unknown ids.
    async fn update_job(&self, id: &JobId, patch: &JobPatch, now: DateTime<Utc>) -> QueueResult<Job>;

    /// Hand the best eligible job to `worker`, or `None`.
    ///
    /// `None` is also returned when another worker won the race for the selected
    /// candidate; the caller retries selection on its next poll rather than
    /// retrying the same candidate.
    async fn claim(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// `processing -> completed`. Returns `false` (no-op) if the job is no longer
    /// `processing` under `worker`'s lease; `NotFound` if it does not exist.
    async fn mark_completed(
        &self,
        id: &JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// `processing -> pending` with the incremented attempt count and delayed
    /// `next_run_at`. Same guard semantics as [`JobStore::mark_completed`].
    async fn mark_failed_retryable(
        &self,
        id: &JobId,
        worker: &WorkerId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// `processing -> dead`. Same guard semantics as [`JobStore::mark_completed`].
    async fn mark_dead(
        &self,
        id: &JobId,
        worker: &WorkerId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Return every lease taken at or before `now - older_than` to `pending`.
    /// An `older_than` reaching past the earliest representable time matches
    /// only leases without a timestamp.
    async fn reclaim_stale_leases(
        &self,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>>;

    /// Reset a dead-lettered job: `{attempts: 0, state: pending, next_run_at: now}`.
    async fn retry_dead_letter(&self, id: &JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        let job = self
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Dead {
            return Err(QueueError::InvalidState {
                id: id.clone(),
                expected: JobState::Dead,
                actual: job.state,
            });
        }
        self.update_job(id, &JobPatch::dlq_reset(now), now).await
    }

    /// Job counts per state.
    async fn stats(&self) -> QueueResult<JobStats> {
        let jobs = self.list_by_state(None).await?;
        Ok(JobStats::from_jobs(&jobs))
    }

    /// Counts plus attempt and duration aggregates.
    async fn metrics(&self) -> QueueResult<JobMetrics> {
        let jobs = self.list_by_state(None).await?;
        Ok(JobMetrics::from_jobs(&jobs))
    }
}

/// Latest `locked_at` still considered stale, or `None` when `now - older_than`
/// is not representable.
pub fn lease_cutoff(now: DateTime<Utc>, older_than: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(older_than)
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobStats {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut stats = JobStats::default();
        for job in jobs {
            stats.record(job.state);
        }
        stats
    }

    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Processing => self.processing += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Dead => self.dead += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

/// Duration aggregates over completed jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub completed_count: usize,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<i64>,
    pub max_ms: Option<i64>,
}

/// Queue-wide metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub counts: JobStats,
    pub total_jobs: usize,
    pub avg_attempts: Option<f64>,
    pub dead_jobs: usize,
    pub durations: DurationStats,
}

impl JobMetrics {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let counts = JobStats::from_jobs(jobs);

        let avg_attempts = (!jobs.is_empty()).then(|| {
            let sum: u64 = jobs.iter().map(|j| u64::from(j.attempts)).sum();
            round2(sum as f64 / jobs.len() as f64)
        });

        let durations: Vec<i64> = jobs
            .iter()
            .filter(|j| j.state == JobState::Completed)
            .filter_map(|j| j.duration_ms)
            .collect();
        let duration_stats = DurationStats {
            completed_count: durations.len(),
            avg_ms: (!durations.is_empty())
                .then(|| round2(durations.iter().sum::<i64>() as f64 / durations.len() as f64)),
            min_ms: durations.iter().copied().min(),
            max_ms: durations.iter().copied().max(),
        };

        Self {
            total_jobs: jobs.len(),
            dead_jobs: counts.dead,
            counts,
            avg_attempts,
            durations: duration_stats,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
