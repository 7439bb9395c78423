//! In-memory job store for tests and embedding.
//!
//! Mirrors the SQLite store's semantics, including the two-step claim: the
//! candidate is selected under a read lock and then claimed under a separate
//! write lock only if it is still `pending`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use queuectl_core::{
    Job, JobId, JobPatch, JobState, NewJob, QueueError, QueueResult, WorkerId, truncate_to_second,
};

use super::store::{JobStore, lease_cutoff};

#[derive(Debug, Clone)]
struct Slot {
    /// Insertion order, breaks `created_at` ties in listings.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Table {
    next_seq: u64,
    rows: HashMap<JobId, Slot>,
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: RwLock<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, Table>> {
        self.table
            .read()
            .map_err(|_| QueueError::storage("job table lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, Table>> {
        self.table
            .write()
            .map_err(|_| QueueError::storage("job table lock poisoned"))
    }

    fn select_candidate(&self, now: DateTime<Utc>) -> QueueResult<Option<JobId>> {
        let table = self.read()?;
        Ok(table
            .rows
            .values()
            .filter(|slot| slot.job.is_eligible(now))
            .min_by(|a, b| a.job.dispatch_order(&b.job))
            .map(|slot| slot.job.id.clone()))
    }

    /// Apply `f` only while the job is `processing` under `worker`'s lease.
    fn transition_from_processing(
        &self,
        id: &JobId,
        worker: &WorkerId,
        f: impl FnOnce(&mut Job),
    ) -> QueueResult<bool> {
        let mut table = self.write()?;
        let slot = table
            .rows
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if slot.job.state != JobState::Processing || slot.job.locked_by.as_ref() != Some(worker) {
            return Ok(false);
        }
        f(&mut slot.job);
        Ok(true)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        job.validate()?;
        let mut table = self.write()?;
        if table.rows.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        let job = Job::pending(job, now);
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(
            job.id.clone(),
            Slot {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn get_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.read()?.rows.get(id).map(|slot| slot.job.clone()))
    }

    async fn list_by_state(&self, state: Option<JobState>) -> QueueResult<Vec<Job>> {
        let table = self.read()?;
        let mut slots: Vec<&Slot> = table
            .rows
            .values()
            .filter(|slot| state.is_none_or(|s| slot.job.state == s))
            .collect();
        slots.sort_by_key(|slot| (slot.job.created_at, slot.seq));
        Ok(slots.into_iter().map(|slot| slot.job.clone()).collect())
    }

    async fn update_job(&self, id: &JobId, patch: &JobPatch, now: DateTime<Utc>) -> QueueResult<Job> {
        let mut table = self.write()?;
        let slot = table
            .rows
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let mut updated = slot.job.clone();
        updated.apply_patch(patch, now)?;
        slot.job = updated.clone();
        Ok(updated)
    }

    async fn claim(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let now = truncate_to_second(now);
        let Some(candidate) = self.select_candidate(now)? else {
            return Ok(None);
        };

        let mut table = self.write()?;
        match table.rows.get_mut(&candidate) {
            Some(slot) if slot.job.state == JobState::Pending => {
                slot.job.claim(worker, now);
                Ok(Some(slot.job.clone()))
            }
            // Lost the race between selection and write.
            _ => Ok(None),
        }
    }

    async fn mark_completed(
        &self,
        id: &JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.transition_from_processing(id, worker, |job| job.complete(now))
    }

    async fn mark_failed_retryable(
        &self,
        id: &JobId,
        worker: &WorkerId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.transition_from_processing(id, worker, |job| {
            job.retry_later(attempts, next_run_at, now)
        })
    }

    async fn mark_dead(
        &self,
        id: &JobId,
        worker: &WorkerId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.transition_from_processing(id, worker, |job| job.bury(attempts, now))
    }

    async fn reclaim_stale_leases(
        &self,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        let now = truncate_to_second(now);
        let cutoff = lease_cutoff(now, older_than);
        let mut table = self.write()?;
        let mut reclaimed = Vec::new();
        for slot in table.rows.values_mut() {
            let stale = slot.job.state == JobState::Processing
                && slot
                    .job
                    .locked_at
                    .is_none_or(|at| cutoff.is_some_and(|cutoff| at <= cutoff));
            if stale {
                slot.job.release(now);
                reclaimed.push(slot.job.id.clone());
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }
}
