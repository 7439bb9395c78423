//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobState;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced synchronously to the caller of a store or submission operation.
///
/// Execution failures of a job's command are *not* represented here: a nonzero
/// exit status is data routed through the retry policy, not an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A job submission was malformed (e.g. missing command).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An insert collided with an existing job id.
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    /// The referenced job does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job exists but is not in a state that allows the requested action.
    #[error("job {id} is {actual}, expected {expected}")]
    InvalidState {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    /// The backing store failed (I/O, SQL, corrupt row).
    #[error("storage error: {0}")]
    Storage(String),

    /// A configuration value could not be read or written.
    #[error("config error: {0}")]
    Config(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error is a caller mistake rather than a store failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueueError::Validation(_)
                | QueueError::DuplicateJob(_)
                | QueueError::NotFound(_)
                | QueueError::InvalidState { .. }
        )
    }
}
