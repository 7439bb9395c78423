//! Integration tests across the store, retry policy and worker loop.
//!
//! Verifies:
//! - Consecutive failures back off by base^attempts seconds
//! - Jobs reach `dead` exactly when the retry budget is spent, and DLQ retry revives them
//! - Shutdown drains: an executing job is finished and reported before exit
//! - Store faults inside an iteration do not terminate the worker
//! - Several workers sharing one SQLite file never run a job twice

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::Notify;

    use queuectl_core::{
        Clock, Job, JobId, JobPatch, JobState, ManualClock, NewJob, QueueError, QueueResult,
        SystemClock, WorkerId,
    };

    use crate::exec::testing::ScriptedRunner;
    use crate::exec::{CommandRunner, ExecError, ExecutionOutcome};
    use crate::jobs::{InMemoryJobStore, JobStore, SqliteJobStore};
    use crate::settings::{BACKOFF_BASE, InMemorySettingsStore, SettingsStore, SqliteSettingsStore};
    use crate::workers::{TickOutcome, Worker, WorkerConfig, shutdown_channel};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap()
    }

    async fn sqlite() -> (tempfile::TempDir, Arc<SqliteJobStore>, Arc<SqliteSettingsStore>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("queue.db")).await.unwrap();
        (
            dir,
            Arc::new(SqliteJobStore::new(pool.clone())),
            Arc::new(SqliteSettingsStore::new(pool)),
        )
    }

    #[tokio::test]
    async fn consecutive_failures_back_off_exponentially() {
        let (_dir, store, settings) = sqlite().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_exit(1).push_exit(1).push_exit(1);

        store
            .enqueue(NewJob::new("flaky", "exit 1").with_max_retries(5), clock.now())
            .await
            .unwrap();
        let mut worker = Worker::new(
            WorkerId::new("worker-1"),
            store.clone(),
            settings,
            runner,
            clock.clone(),
            WorkerConfig::default(),
        );

        let mut deltas = Vec::new();
        for _ in 0..3 {
            let now = clock.now();
            match worker.tick().await.unwrap() {
                TickOutcome::Retried { next_run_at, .. } => {
                    deltas.push((next_run_at - now).num_seconds());
                    // Not claimable a second early.
                    clock.set(next_run_at - chrono::Duration::seconds(1));
                    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
                    clock.set(next_run_at);
                }
                other => panic!("expected a retry, got {other:?}"),
            }
        }
        assert_eq!(deltas, vec![2, 4, 8]);

        let job = store.get_job(&JobId::new("flaky")).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn backoff_base_change_applies_to_next_failure() {
        let (_dir, store, settings) = sqlite().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_exit(2);

        store.enqueue(NewJob::new("a", "exit 2"), clock.now()).await.unwrap();
        settings.set(BACKOFF_BASE, "5").await.unwrap();
        let mut worker = Worker::new(
            WorkerId::new("worker-1"),
            store,
            settings,
            runner,
            clock.clone(),
            WorkerConfig::default(),
        );

        match worker.tick().await.unwrap() {
            TickOutcome::Retried { next_run_at, .. } => {
                assert_eq!(next_run_at, t0() + chrono::Duration::seconds(5));
            }
            other => panic!("expected a retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_dead_letters_then_dlq_retry_revives() {
        let (_dir, store, settings) = sqlite().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_exit(1).push_exit(1).push_exit(1);

        store
            .enqueue(NewJob::new("doomed", "exit 1").with_max_retries(2), clock.now())
            .await
            .unwrap();
        let mut worker = Worker::new(
            WorkerId::new("worker-1"),
            store.clone(),
            settings,
            runner.clone(),
            clock.clone(),
            WorkerConfig::default(),
        );

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(worker.tick().await.unwrap());
            clock.advance(chrono::Duration::hours(1));
        }
        assert!(matches!(outcomes[0], TickOutcome::Retried { attempts: 1, .. }));
        assert!(matches!(outcomes[1], TickOutcome::Retried { attempts: 2, .. }));
        assert_eq!(
            outcomes[2],
            TickOutcome::DeadLettered {
                id: JobId::new("doomed"),
                attempts: 3
            }
        );

        // Dead is terminal for automatic processing.
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
        let dead = store.list_by_state(Some(JobState::Dead)).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(dead[0].locked_by.is_none());

        let revived = store.retry_dead_letter(&JobId::new("doomed"), clock.now()).await.unwrap();
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.state, JobState::Pending);

        // The scripted runner has no failures left, so the next run succeeds.
        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Completed(JobId::new("doomed"))
        );
        assert_eq!(worker.stats().jobs_dead_lettered, 1);
        assert_eq!(runner.commands().len(), 4);
    }

    /// Blocks inside `run` until released.
    struct GatedRunner {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CommandRunner for GatedRunner {
        async fn run(
            &self,
            _command: &str,
            _timeout: Option<Duration>,
        ) -> Result<ExecutionOutcome, ExecError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(ExecutionOutcome::exited(0).with_stdout("done\n"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_finishes_the_running_job_first() {
        let store = Arc::new(InMemoryJobStore::new());
        let runner = Arc::new(GatedRunner {
            started: Notify::new(),
            release: Notify::new(),
        });
        store
            .enqueue(NewJob::new("long", "sleep 60"), SystemClock.now())
            .await
            .unwrap();
        store
            .enqueue(NewJob::new("next", "true"), SystemClock.now())
            .await
            .unwrap();

        let worker = Worker::new(
            WorkerId::new("worker-1"),
            store.clone(),
            Arc::new(InMemorySettingsStore::new()),
            runner.clone(),
            Arc::new(SystemClock),
            WorkerConfig::default(),
        );
        let (handle, rx) = shutdown_channel();
        let join = tokio::spawn(worker.run(rx));

        runner.started.notified().await;
        handle.shutdown();
        assert!(handle.is_draining());
        runner.release.notify_one();

        let stats = join.await.unwrap();
        assert_eq!(stats.jobs_processed, 1);
        assert_eq!(stats.jobs_succeeded, 1);

        let long = store.get_job(&JobId::new("long")).await.unwrap().unwrap();
        assert_eq!(long.state, JobState::Completed);
        // Draining stops further claims.
        let next = store.get_job(&JobId::new("next")).await.unwrap().unwrap();
        assert_eq!(next.state, JobState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_exits_promptly_on_shutdown() {
        let worker = Worker::new(
            WorkerId::new("worker-1"),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemorySettingsStore::new()),
            Arc::new(ScriptedRunner::new()),
            Arc::new(SystemClock),
            WorkerConfig {
                poll_interval: Duration::from_secs(3600),
                ..WorkerConfig::default()
            },
        );
        let (handle, rx) = shutdown_channel();
        let join = tokio::spawn(worker.run(rx));

        tokio::task::yield_now().await;
        let started = tokio::time::Instant::now();
        handle.shutdown();
        let stats = join.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(stats, Default::default());
    }

    /// Store whose first `failures` claims error out.
    struct FlakyStore {
        inner: InMemoryJobStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
            self.inner.enqueue(job, now).await
        }

        async fn get_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
            self.inner.get_job(id).await
        }

        async fn list_by_state(&self, state: Option<JobState>) -> QueueResult<Vec<Job>> {
            self.inner.list_by_state(state).await
        }

        async fn update_job(
            &self,
            id: &JobId,
            patch: &JobPatch,
            now: DateTime<Utc>,
        ) -> QueueResult<Job> {
            self.inner.update_job(id, patch, now).await
        }

        async fn claim(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(QueueError::storage("database is locked"));
            }
            self.inner.claim(worker, now).await
        }

        async fn mark_completed(
            &self,
            id: &JobId,
            worker: &WorkerId,
            now: DateTime<Utc>,
        ) -> QueueResult<bool> {
            self.inner.mark_completed(id, worker, now).await
        }

        async fn mark_failed_retryable(
            &self,
            id: &JobId,
            worker: &WorkerId,
            attempts: u32,
            next_run_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> QueueResult<bool> {
            self.inner
                .mark_failed_retryable(id, worker, attempts, next_run_at, now)
                .await
        }

        async fn mark_dead(
            &self,
            id: &JobId,
            worker: &WorkerId,
            attempts: u32,
            now: DateTime<Utc>,
        ) -> QueueResult<bool> {
            self.inner.mark_dead(id, worker, attempts, now).await
        }

        async fn reclaim_stale_leases(
            &self,
            older_than: chrono::Duration,
            now: DateTime<Utc>,
        ) -> QueueResult<Vec<JobId>> {
            self.inner.reclaim_stale_leases(older_than, now).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_faults_are_survived() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryJobStore::new(),
            failures: AtomicU32::new(2),
        });
        store
            .enqueue(NewJob::new("a", "true"), SystemClock.now())
            .await
            .unwrap();

        let worker = Worker::new(
            WorkerId::new("worker-1"),
            store.clone(),
            Arc::new(InMemorySettingsStore::new()),
            Arc::new(ScriptedRunner::new()),
            Arc::new(SystemClock),
            WorkerConfig::default(),
        );
        let (handle, rx) = shutdown_channel();
        let join = tokio::spawn(worker.run(rx));

        for _ in 0..100 {
            let job = store.get_job(&JobId::new("a")).await.unwrap().unwrap();
            if job.state == JobState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        handle.shutdown();
        let stats = join.await.unwrap();

        assert_eq!(stats.loop_faults, 2);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_sharing_sqlite_run_each_job_once() {
        let (_dir, store, settings) = sqlite().await;
        let clock = SystemClock;
        for i in 0..20 {
            store
                .enqueue(NewJob::new(format!("job-{i:02}"), format!("echo {i}")), clock.now())
                .await
                .unwrap();
        }

        let runner = Arc::new(ScriptedRunner::new());
        let mut handles = Vec::new();
        let mut joins = Vec::new();
        for w in 0..4u32 {
            let worker = Worker::new(
                WorkerId::for_pid(1000 + w),
                store.clone(),
                settings.clone(),
                runner.clone(),
                Arc::new(SystemClock),
                WorkerConfig {
                    poll_interval: Duration::from_millis(10),
                    ..WorkerConfig::default()
                },
            );
            let (handle, rx) = shutdown_channel();
            handles.push(handle);
            joins.push(tokio::spawn(worker.run(rx)));
        }

        for _ in 0..1000 {
            if store.stats().await.unwrap().completed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in &handles {
            handle.shutdown();
        }
        let mut succeeded = 0;
        for join in joins {
            succeeded += join.await.unwrap().jobs_succeeded;
        }

        assert_eq!(succeeded, 20);
        let commands = runner.commands();
        let unique: HashSet<_> = commands.iter().collect();
        assert_eq!(commands.len(), 20);
        assert_eq!(unique.len(), 20);
    }
}
