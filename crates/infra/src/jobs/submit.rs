//! Job submission: fill defaults from settings, validate, insert.

use tracing::info;

use queuectl_core::{Clock, Job, JobRequest, QueueResult};

use super::store::JobStore;
use crate::settings::SettingsStore;

/// Submit a client request.
///
/// A request without `max_retries` takes the current `default_max_retries`
/// setting; a request without an id gets a generated one.
pub async fn submit<S, C>(
    store: &S,
    settings: &C,
    request: JobRequest,
    clock: &dyn Clock,
) -> QueueResult<Job>
where
    S: JobStore + ?Sized,
    C: SettingsStore + ?Sized,
{
    let default_max_retries = settings.default_max_retries().await?;
    let new = request.into_new_job(default_max_retries)?;
    let job = store.enqueue(new, clock.now()).await?;
    info!(
        job_id = %job.id,
        priority = job.priority,
        max_retries = job.max_retries,
        "job enqueued"
    );
    Ok(job)
}
