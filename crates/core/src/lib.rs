//! `queuectl-core`: job lifecycle domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job record and its state machine, identifiers, the clock abstraction and
//! the retry/backoff/dead-letter policy.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock, truncate_to_second};
pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobPatch, JobRequest, JobState, NewJob};
pub use retry::{FailureDecision, RetryPolicy};
