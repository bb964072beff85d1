//! JOB_ABORT handler.
//!
//! Abort is advisory: the job is purged from every set and its client is
//! told DELETED, but a worker already executing it keeps running and its
//! outcome is discarded when it arrives.

use meteor_protocol::{Envelope, JobState};
use tracing::info;

use super::job_ids;
use crate::error::RequestError;
use crate::state::SchedulerState;

pub fn handle(request: &Envelope, state: &mut SchedulerState) -> Result<Envelope, RequestError> {
    let (client_id, job_id) = job_ids(request)?;
    match state.remove(client_id, job_id) {
        Some(job) => info!(client_id, job_id, was = %job.state(), "job aborted"),
        None => info!(client_id, job_id, "abort for unknown job"),
    }
    Ok(Envelope::job_status(client_id, job_id, Some(JobState::Deleted)))
}
