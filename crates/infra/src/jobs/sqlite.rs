//! SQLite-backed job store.
//!
//! ## Claim protocol
//!
//! `claim()` is two statements:
//! 1. `SELECT` the best eligible candidate (priority, overdue-ness, creation order)
//! 2. `UPDATE ... WHERE id = ? AND state = 'pending' RETURNING ...`
//!
//! No lock is held between the two. If another worker claimed the candidate in
//! between, step 2 matches zero rows and the caller gets `None`. The `state`
//! guard on the single `UPDATE` is what makes a claim linearizable per row.
//!
//! Reports (`mark_*`) are guarded on `state = 'processing' AND locked_by = ?`,
//! so a worker whose lease was reclaimed and handed to another worker cannot
//! overwrite the new holder's outcome.
//!
//! ## Error Mapping
//!
//! | SQLx error | QueueError |
//! |------------|------------|
//! | Database (unique/primary key violation on insert) | `DuplicateJob` |
//! | Database (other) | `Storage` |
//! | PoolClosed / PoolTimedOut / other | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{
    Job, JobId, JobPatch, JobState, NewJob, QueueError, QueueResult, WorkerId, truncate_to_second,
};

use super::store::{DurationStats, JobMetrics, JobStats, JobStore, lease_cutoff};
use crate::db::{format_ts, is_unique_violation, map_sqlx_error, parse_opt_ts, parse_ts};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, created_at, \
    updated_at, next_run_at, started_at, finished_at, duration_ms, locked_by, locked_at, \
    timeout_seconds";

/// Job store persisted in the queue database.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn select_candidate(&self, now: &str) -> QueueResult<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE state = 'pending' AND (next_run_at IS NULL OR next_run_at <= ?1)
            ORDER BY priority DESC, next_run_at ASC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_candidate", e))
    }

    async fn exists(&self, id: &JobId) -> QueueResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_exists", e))?;
        Ok(found.is_some())
    }

    /// Translate a zero-row guarded update into `false` or `NotFound`.
    async fn guarded_outcome(&self, id: &JobId, rows_affected: u64) -> QueueResult<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(QueueError::NotFound(id.clone()))
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        job.validate()?;
        let job = Job::pending(job, now);

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, priority,
                created_at, updated_at, next_run_at, timeout_seconds
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(job.priority)
        .bind(format_ts(job.created_at))
        .bind(format_ts(job.updated_at))
        .bind(job.next_run_at.map(format_ts))
        .bind(job.timeout_seconds.map(i64::from))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(e) if is_unique_violation(&e) => Err(QueueError::DuplicateJob(job.id)),
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn get_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(Job::try_from).transpose()
    }

    async fn list_by_state(&self, state: Option<JobState>) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR state = ?1) ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self, patch), fields(job_id = %id), err)]
    async fn update_job(&self, id: &JobId, patch: &JobPatch, now: DateTime<Utc>) -> QueueResult<Job> {
        patch.validate()?;
        let current = self
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let mut updated = current.clone();
        updated.apply_patch(patch, now)?;

        // Guard on the version we read so a concurrent claim or report is not overwritten.
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?1,
                attempts = ?2,
                max_retries = ?3,
                priority = ?4,
                next_run_at = ?5,
                timeout_seconds = ?6,
                locked_by = ?7,
                locked_at = ?8,
                updated_at = ?9
            WHERE id = ?10 AND state = ?11 AND updated_at = ?12
            "#,
        )
        .bind(updated.state.as_str())
        .bind(i64::from(updated.attempts))
        .bind(i64::from(updated.max_retries))
        .bind(updated.priority)
        .bind(updated.next_run_at.map(format_ts))
        .bind(updated.timeout_seconds.map(i64::from))
        .bind(updated.locked_by.as_ref().map(|w| w.as_str().to_string()))
        .bind(updated.locked_at.map(format_ts))
        .bind(format_ts(updated.updated_at))
        .bind(id.as_str())
        .bind(current.state.as_str())
        .bind(format_ts(current.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::storage(format!(
                "job {id} was modified concurrently; retry the update"
            )));
        }
        Ok(updated)
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn claim(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let now = format_ts(now);
        let Some(candidate) = self.select_candidate(&now).await? else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs SET
                state = 'processing',
                locked_by = ?1,
                locked_at = ?2,
                started_at = ?2,
                finished_at = NULL,
                duration_ms = NULL,
                updated_at = MAX(updated_at, ?2)
            WHERE id = ?3 AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker.as_str())
        .bind(&now)
        .bind(&candidate)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        match row {
            Some(row) => Job::try_from(row).map(Some),
            None => {
                debug!(job_id = %candidate, "lost claim race");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %id, worker = %worker), err)]
    async fn mark_completed(
        &self,
        id: &JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let now = format_ts(now);
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'completed',
                finished_at = ?1,
                duration_ms = CASE
                    WHEN started_at IS NULL THEN NULL
                    ELSE MAX(0, (CAST(strftime('%s', ?1) AS INTEGER)
                               - CAST(strftime('%s', started_at) AS INTEGER)) * 1000)
                END,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = MAX(updated_at, ?1)
            WHERE id = ?2 AND state = 'processing' AND locked_by = ?3
            "#,
        )
        .bind(&now)
        .bind(id.as_str())
        .bind(worker.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        self.guarded_outcome(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(job_id = %id, worker = %worker), err)]
    async fn mark_failed_retryable(
        &self,
        id: &JobId,
        worker: &WorkerId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'pending',
                attempts = ?1,
                next_run_at = ?2,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = MAX(updated_at, ?3)
            WHERE id = ?4 AND state = 'processing' AND locked_by = ?5
            "#,
        )
        .bind(i64::from(attempts))
        .bind(format_ts(next_run_at))
        .bind(format_ts(now))
        .bind(id.as_str())
        .bind(worker.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_retryable", e))?;

        self.guarded_outcome(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(job_id = %id, worker = %worker), err)]
    async fn mark_dead(
        &self,
        id: &JobId,
        worker: &WorkerId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'dead',
                attempts = ?1,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = MAX(updated_at, ?2)
            WHERE id = ?3 AND state = 'processing' AND locked_by = ?4
            "#,
        )
        .bind(i64::from(attempts))
        .bind(format_ts(now))
        .bind(id.as_str())
        .bind(worker.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dead", e))?;

        self.guarded_outcome(id, result.rows_affected()).await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale_leases(
        &self,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        let now = truncate_to_second(now);
        let mut ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET
                state = 'pending',
                next_run_at = ?1,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = MAX(updated_at, ?1)
            WHERE state = 'processing' AND (locked_at IS NULL OR locked_at <= ?2)
            RETURNING id
            "#,
        )
        .bind(format_ts(now))
        // A NULL cutoff compares false, leaving only lease-less rows.
        .bind(lease_cutoff(now, older_than).map(format_ts))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale_leases", e))?;

        ids.sort();
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    async fn stats(&self) -> QueueResult<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS cnt FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("cnt").map_err(|e| map_sqlx_error("stats", e))?;
            let state: JobState = state
                .parse()
                .map_err(|_| QueueError::storage(format!("unknown state {state:?} in database")))?;
            let count = usize::try_from(count).unwrap_or_default();
            match state {
                JobState::Pending => stats.pending = count,
                JobState::Processing => stats.processing = count,
                JobState::Completed => stats.completed = count,
                JobState::Failed => stats.failed = count,
                JobState::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }

    async fn metrics(&self) -> QueueResult<JobMetrics> {
        let counts = self.stats().await?;

        let durations = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS completed_count,
                ROUND(AVG(duration_ms), 2) AS avg_ms,
                MIN(duration_ms) AS min_ms,
                MAX(duration_ms) AS max_ms
            FROM jobs
            WHERE state = 'completed' AND duration_ms IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("duration_metrics", e))?;

        let overall = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_jobs,
                ROUND(AVG(attempts), 2) AS avg_attempts,
                COALESCE(SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END), 0) AS dead_jobs
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("overall_metrics", e))?;

        let read = |e| map_sqlx_error("metrics", e);
        let completed_count: i64 = durations.try_get("completed_count").map_err(read)?;
        let total_jobs: i64 = overall.try_get("total_jobs").map_err(read)?;
        let dead_jobs: i64 = overall.try_get("dead_jobs").map_err(read)?;

        Ok(JobMetrics {
            counts,
            total_jobs: usize::try_from(total_jobs).unwrap_or_default(),
            avg_attempts: overall.try_get("avg_attempts").map_err(read)?,
            dead_jobs: usize::try_from(dead_jobs).unwrap_or_default(),
            durations: DurationStats {
                completed_count: usize::try_from(completed_count).unwrap_or_default(),
                avg_ms: durations.try_get("avg_ms").map_err(read)?,
                min_ms: durations.try_get("min_ms").map_err(read)?,
                max_ms: durations.try_get("max_ms").map_err(read)?,
            },
        })
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    priority: i64,
    created_at: String,
    updated_at: String,
    next_run_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
    locked_by: Option<String>,
    locked_at: Option<String>,
    timeout_seconds: Option<i64>,
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            max_retries: row.try_get("max_retries")?,
            priority: row.try_get("priority")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            next_run_at: row.try_get("next_run_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_ms: row.try_get("duration_ms")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
        })
    }
}

fn column_u32(id: &str, column: &str, value: i64) -> QueueResult<u32> {
    u32::try_from(value)
        .map_err(|_| QueueError::storage(format!("job {id}: {column} out of range ({value})")))
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|_| QueueError::storage(format!("job {}: unknown state {:?}", row.id, row.state)))?;
        let timeout_seconds = row
            .timeout_seconds
            .map(|v| column_u32(&row.id, "timeout_seconds", v))
            .transpose()?;

        Ok(Job {
            attempts: column_u32(&row.id, "attempts", row.attempts)?,
            max_retries: column_u32(&row.id, "max_retries", row.max_retries)?,
            state,
            command: row.command,
            priority: row.priority,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            next_run_at: parse_opt_ts(row.next_run_at)?,
            started_at: parse_opt_ts(row.started_at)?,
            finished_at: parse_opt_ts(row.finished_at)?,
            duration_ms: row.duration_ms,
            locked_by: row.locked_by.map(WorkerId::new),
            locked_at: parse_opt_ts(row.locked_at)?,
            timeout_seconds,
            id: JobId::new(row.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    async fn store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("queue.db")).await.unwrap();
        (dir, SqliteJobStore::new(pool))
    }

    #[tokio::test]
    async fn enqueue_then_get_round_trips() {
        let (_dir, store) = store().await;
        let new = NewJob::new("job-1", "echo 'hello world'")
            .with_max_retries(2)
            .with_priority(-3)
            .with_timeout_seconds(10);
        let inserted = store.enqueue(new, t0()).await.unwrap();
        let fetched = store.get_job(&JobId::new("job-1")).await.unwrap().unwrap();

        assert_eq!(inserted, fetched);
        assert_eq!(fetched.state, JobState::Pending);
        assert_eq!(fetched.priority, -3);
        assert_eq!(fetched.created_at, t0());
        assert_eq!(fetched.next_run_at, Some(t0()));
    }

    #[tokio::test]
    async fn duplicate_insert_maps_to_duplicate_job() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("dup", "true"), t0()).await.unwrap();
        let err = store.enqueue(NewJob::new("dup", "false"), t0()).await.unwrap_err();
        assert_eq!(err, QueueError::DuplicateJob(JobId::new("dup")));
    }

    #[tokio::test]
    async fn claim_order_is_priority_then_fifo() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("a", "true").with_priority(5), t0()).await.unwrap();
        store
            .enqueue(NewJob::new("b", "true").with_priority(5), t0() + Duration::seconds(1))
            .await
            .unwrap();
        store
            .enqueue(NewJob::new("c", "true").with_priority(10), t0() + Duration::seconds(2))
            .await
            .unwrap();

        let worker = WorkerId::new("worker-1");
        let now = t0() + Duration::seconds(5);
        let mut order = Vec::new();
        while let Some(job) = store.claim(&worker, now).await.unwrap() {
            assert_eq!(job.state, JobState::Processing);
            assert_eq!(job.locked_at, Some(now));
            order.push(job.id.to_string());
        }
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn scheduled_job_becomes_claimable_exactly_when_due() {
        let (_dir, store) = store().await;
        let due = t0() + Duration::seconds(4);
        store.enqueue(NewJob::new("later", "true").run_at(due), t0()).await.unwrap();
        let worker = WorkerId::new("worker-1");

        assert!(store.claim(&worker, due - Duration::seconds(1)).await.unwrap().is_none());
        assert!(store.claim(&worker, due).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_each_job_once() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            store.enqueue(NewJob::new(format!("job-{i}"), "true"), t0()).await.unwrap();
        }

        let store = Arc::new(store);
        let mut handles = Vec::new();
        for w in 0..8u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let worker = WorkerId::for_pid(w);
                let mut claimed = Vec::new();
                for _ in 0..10 {
                    if let Some(job) = store.claim(&worker, t0()).await.unwrap() {
                        claimed.push(job.id);
                    }
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), unique.len(), "a job was claimed twice");
        assert!(all.len() <= 5);
        assert_eq!(store.stats().await.unwrap().processing, all.len());
    }

    #[tokio::test]
    async fn completion_computes_duration_once() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("a", "true"), t0()).await.unwrap();
        let worker = WorkerId::new("w");
        store.claim(&worker, t0()).await.unwrap().unwrap();

        let id = JobId::new("a");
        assert!(store.mark_completed(&id, &worker, t0() + Duration::seconds(3)).await.unwrap());
        assert!(!store.mark_completed(&id, &worker, t0() + Duration::seconds(10)).await.unwrap());

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.duration_ms, Some(3000));
        assert_eq!(job.finished_at, Some(t0() + Duration::seconds(3)));
        assert!(job.locked_by.is_none() && job.locked_at.is_none());
    }

    #[tokio::test]
    async fn failure_paths_clear_the_lease() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("a", "false"), t0()).await.unwrap();
        let worker = WorkerId::new("w");
        store.claim(&worker, t0()).await.unwrap().unwrap();

        let id = JobId::new("a");
        let retry_at = t0() + Duration::seconds(2);
        assert!(store.mark_failed_retryable(&id, &worker, 1, retry_at, t0()).await.unwrap());
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.next_run_at, Some(retry_at));
        assert!(job.locked_by.is_none());

        // Not processing any more: dead transition is a guarded no-op.
        assert!(!store.mark_dead(&id, &worker, 2, t0()).await.unwrap());
        let err = store.mark_dead(&JobId::new("ghost"), &worker, 1, t0()).await.unwrap_err();
        assert_eq!(err, QueueError::NotFound(JobId::new("ghost")));
    }

    #[tokio::test]
    async fn dead_letter_retry_resets_attempts() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("a", "false"), t0()).await.unwrap();
        let worker = WorkerId::new("w");
        store.claim(&worker, t0()).await.unwrap().unwrap();
        store.mark_dead(&JobId::new("a"), &worker, 4, t0()).await.unwrap();

        let later = t0() + Duration::hours(1);
        let job = store.retry_dead_letter(&JobId::new("a"), later).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_run_at, Some(later));

        let stored = store.get_job(&JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored, job);
    }

    #[tokio::test]
    async fn stale_leases_return_to_pending() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("a", "sleep 100"), t0()).await.unwrap();
        store.claim(&WorkerId::new("crashed"), t0()).await.unwrap().unwrap();

        let early = store
            .reclaim_stale_leases(Duration::seconds(60), t0() + Duration::seconds(30))
            .await
            .unwrap();
        assert!(early.is_empty());

        let now = t0() + Duration::seconds(60);
        let reclaimed = store.reclaim_stale_leases(Duration::seconds(60), now).await.unwrap();
        assert_eq!(reclaimed, vec![JobId::new("a")]);
        let job = store.get_job(&JobId::new("a")).await.unwrap().unwrap();
        assert!(job.is_eligible(now));
    }

    #[tokio::test]
    async fn report_from_reclaimed_lease_is_rejected() {
        let (_dir, store) = store().await;
        let id = JobId::new("a");
        let (stale, live) = (WorkerId::new("worker-a"), WorkerId::new("worker-b"));
        store.enqueue(NewJob::new("a", "sleep 100"), t0()).await.unwrap();
        store.claim(&stale, t0()).await.unwrap().unwrap();

        let now = t0() + Duration::seconds(120);
        let reclaimed = store.reclaim_stale_leases(Duration::seconds(60), now).await.unwrap();
        assert_eq!(reclaimed, vec![id.clone()]);
        store.claim(&live, now).await.unwrap().unwrap();

        assert!(!store.mark_completed(&id, &stale, now).await.unwrap());
        assert!(!store.mark_failed_retryable(&id, &stale, 1, now, now).await.unwrap());
        assert!(!store.mark_dead(&id, &stale, 1, now).await.unwrap());
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by, Some(live.clone()));

        assert!(store.mark_completed(&id, &live, now + Duration::seconds(2)).await.unwrap());
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.duration_ms, Some(2000));
    }

    #[tokio::test]
    async fn oversized_reclaim_window_is_not_an_error() {
        let (_dir, store) = store().await;
        store.enqueue(NewJob::new("a", "true"), t0()).await.unwrap();
        store.claim(&WorkerId::new("w"), t0()).await.unwrap().unwrap();

        let reclaimed = store
            .reclaim_stale_leases(Duration::seconds(10_000_000_000_000), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(store.stats().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn overdue_retry_beats_older_job_scheduled_later() {
        let (_dir, store) = store().await;
        let worker = WorkerId::new("w");
        // Created first, then pushed back by a failed attempt.
        store.enqueue(NewJob::new("x", "false"), t0()).await.unwrap();
        store.claim(&worker, t0()).await.unwrap().unwrap();
        let retry_at = t0() + Duration::seconds(8);
        assert!(store.mark_failed_retryable(&JobId::new("x"), &worker, 1, retry_at, t0()).await.unwrap());
        // Created later, but due earlier.
        store
            .enqueue(NewJob::new("y", "true").run_at(t0() + Duration::seconds(2)), t0() + Duration::seconds(1))
            .await
            .unwrap();

        let now = t0() + Duration::seconds(10);
        let first = store.claim(&worker, now).await.unwrap().unwrap();
        let second = store.claim(&worker, now).await.unwrap().unwrap();
        assert_eq!(first.id, JobId::new("y"));
        assert_eq!(second.id, JobId::new("x"));
    }

    #[tokio::test]
    async fn metrics_match_sql_aggregates() {
        let (_dir, store) = store().await;
        let worker = WorkerId::new("w");
        for id in ["a", "b", "c"] {
            store.enqueue(NewJob::new(id, "true"), t0()).await.unwrap();
        }
        store.claim(&worker, t0()).await.unwrap().unwrap();
        store.mark_completed(&JobId::new("a"), &worker, t0() + Duration::seconds(2)).await.unwrap();
        store.claim(&worker, t0()).await.unwrap().unwrap();
        store.mark_dead(&JobId::new("b"), &worker, 3, t0()).await.unwrap();

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.total_jobs, 3);
        assert_eq!(metrics.dead_jobs, 1);
        assert_eq!(metrics.counts.pending, 1);
        assert_eq!(metrics.avg_attempts, Some(1.0));
        assert_eq!(metrics.durations.completed_count, 1);
        assert_eq!(metrics.durations.min_ms, Some(2000));
    }
}
