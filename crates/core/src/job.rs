//! Job record and its state machine.
//!
//! ```text
//!   pending ──claim──▶ processing ──success──▶ completed
//!      ▲                   │
//!      └──retry (backoff)──┤
//!                          └──retries exhausted──▶ dead ──dlq retry──▶ pending
//! ```

use core::cmp::Ordering;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::truncate_to_second;
use crate::error::{QueueError, QueueResult};
use crate::id::{JobId, WorkerId};

/// Retry ceiling applied when neither the request nor the settings provide one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker; eligible once `next_run_at` has passed.
    Pending,
    /// Leased by exactly one worker.
    Processing,
    /// Finished with exit status 0. Terminal.
    Completed,
    /// Vocabulary only: a failed attempt is stored as `Pending` with more attempts.
    Failed,
    /// Retry budget exhausted (the dead-letter queue). Terminal until reset.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::validation(format!("unknown job state: {other}"))),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    /// Higher values are dispatched first.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` or a past instant means immediately eligible.
    pub next_run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<u32>,
}

impl Job {
    /// Build the initial `pending` record for a validated submission.
    pub fn pending(new: NewJob, now: DateTime<Utc>) -> Self {
        let now = truncate_to_second(now);
        Self {
            id: new.id,
            command: new.command,
            state: JobState::Pending,
            attempts: new.attempts,
            max_retries: new.max_retries,
            priority: new.priority,
            created_at: now,
            updated_at: now,
            next_run_at: Some(new.next_run_at.map(truncate_to_second).unwrap_or(now)),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            locked_by: None,
            locked_at: None,
            timeout_seconds: new.timeout_seconds,
        }
    }

    /// `state = pending AND (next_run_at IS NULL OR next_run_at <= now)`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Dispatch order among eligible jobs: priority descending, then the most
    /// overdue `next_run_at`, then earliest creation. Ties fall back to id.
    pub fn dispatch_order(&self, other: &Job) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.next_run_at.cmp(&other.next_run_at))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(|s| Duration::from_secs(u64::from(s)))
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(truncate_to_second(now));
    }

    fn clear_lease(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    /// `pending -> processing`. Caller must have checked the state.
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        let now = truncate_to_second(now);
        self.state = JobState::Processing;
        self.locked_by = Some(worker.clone());
        self.locked_at = Some(now);
        self.started_at = Some(now);
        self.finished_at = None;
        self.duration_ms = None;
        self.touch(now);
    }

    /// `processing -> completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        let now = truncate_to_second(now);
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0));
        self.clear_lease();
        self.touch(now);
    }

    /// `processing -> pending` with a delayed `next_run_at`.
    pub fn retry_later(&mut self, attempts: u32, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = attempts;
        self.next_run_at = Some(truncate_to_second(next_run_at));
        self.clear_lease();
        self.touch(now);
    }

    /// `processing -> dead`.
    pub fn bury(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.state = JobState::Dead;
        self.attempts = attempts;
        self.clear_lease();
        self.touch(now);
    }

    /// Return an abandoned lease to the pool, immediately eligible.
    pub fn release(&mut self, now: DateTime<Utc>) {
        let now = truncate_to_second(now);
        self.state = JobState::Pending;
        self.next_run_at = Some(now);
        self.clear_lease();
        self.touch(now);
    }

    /// Merge an administrative patch into the record.
    pub fn apply_patch(&mut self, patch: &JobPatch, now: DateTime<Utc>) -> QueueResult<()> {
        patch.validate()?;
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(next_run_at) = patch.next_run_at {
            self.next_run_at = next_run_at.map(truncate_to_second);
        }
        if let Some(timeout_seconds) = patch.timeout_seconds {
            self.timeout_seconds = timeout_seconds;
        }
        if self.state != JobState::Processing {
            self.clear_lease();
        }
        self.touch(now);
        Ok(())
    }
}

/// A validated submission, ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    pub attempts: u32,
    pub max_retries: u32,
    pub priority: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<u32>,
}

impl NewJob {
    pub fn new(id: impl Into<JobId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            next_run_at: None,
            timeout_seconds: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(QueueError::validation("job id must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::validation("job must have a non-empty \"command\""));
        }
        validate_timeout(self.timeout_seconds)
    }
}

/// A zero timeout would kill every command on its first poll; omit the field
/// to run without a limit.
fn validate_timeout(timeout_seconds: Option<u32>) -> QueueResult<()> {
    if timeout_seconds == Some(0) {
        return Err(QueueError::validation(
            "timeout_seconds must be positive; omit it for no timeout",
        ));
    }
    Ok(())
}

/// Scheduled start accepted by [`JobRequest::run_at`]: RFC 3339 text or epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunAt {
    EpochSeconds(i64),
    Text(String),
}

impl RunAt {
    pub fn resolve(&self) -> QueueResult<DateTime<Utc>> {
        match self {
            RunAt::EpochSeconds(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| QueueError::validation(format!("run_at out of range: {secs}"))),
            RunAt::Text(text) => {
                if let Ok(secs) = text.trim().parse::<i64>() {
                    return RunAt::EpochSeconds(secs).resolve();
                }
                DateTime::parse_from_rfc3339(text.trim())
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| QueueError::validation(format!("invalid run_at {text:?}: {e}")))
            }
        }
    }
}

/// Raw submission as it arrives from a client (JSON or flags).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_at: Option<RunAt>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
}

impl JobRequest {
    pub fn from_json(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::validation(format!("invalid job JSON: {e}")))
    }

    /// Resolve defaults and validate. A blank id is replaced by a generated one.
    pub fn into_new_job(self, default_max_retries: u32) -> QueueResult<NewJob> {
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => JobId::new(id),
            _ => JobId::generate(),
        };
        let command = self
            .command
            .ok_or_else(|| QueueError::validation("job must have a non-empty \"command\""))?;

        let next_run_at = match (self.next_run_at, self.run_at) {
            (Some(at), _) => Some(at),
            (None, Some(run_at)) => Some(run_at.resolve()?),
            (None, None) => None,
        };

        let new = NewJob {
            id,
            command,
            attempts: self.attempts.unwrap_or(0),
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            priority: self.priority.unwrap_or(0),
            next_run_at,
            timeout_seconds: self.timeout_seconds,
        };
        new.validate()?;
        Ok(new)
    }
}

/// Administrative partial update. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub max_retries: Option<u32>,
    pub priority: Option<i64>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub timeout_seconds: Option<Option<u32>>,
}

impl JobPatch {
    /// The dead-letter retry reset: `{attempts: 0, state: pending, next_run_at: now}`.
    pub fn dlq_reset(now: DateTime<Utc>) -> Self {
        Self {
            state: Some(JobState::Pending),
            attempts: Some(0),
            next_run_at: Some(Some(truncate_to_second(now))),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        match self.state {
            Some(JobState::Processing) => Err(QueueError::validation(
                "processing can only be entered by claiming the job",
            )),
            Some(JobState::Failed) => Err(QueueError::validation(
                "failed is not a resting state; use pending with attempts",
            )),
            _ => validate_timeout(self.timeout_seconds.flatten()),
        }
    }
}
