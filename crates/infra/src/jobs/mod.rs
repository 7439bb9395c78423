//! Job persistence and submission.
//!
//! ## Components
//!
//! - `JobStore`: durable job records, the claim protocol and guarded transitions
//! - `SqliteJobStore`: the store shared by every worker process
//! - `InMemoryJobStore`: same contract, for tests and embedding
//! - `submit`: applies settings defaults to a client request and enqueues it

pub mod in_memory;
pub mod sqlite;
pub mod store;
pub mod submit;

pub use in_memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{DurationStats, JobMetrics, JobStats, JobStore};
pub use submit::submit;
