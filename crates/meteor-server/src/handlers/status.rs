//! JOB_STATUS handler.

use meteor_protocol::{Envelope, JobState};

use super::job_ids;
use crate::error::RequestError;
use crate::state::SchedulerState;

/// Reply with the job's state (and error text when failed); DELETED for unknown jobs.
pub fn handle(request: &Envelope, state: &SchedulerState) -> Result<Envelope, RequestError> {
    let (client_id, job_id) = job_ids(request)?;
    let Some(job) = state.job(client_id, job_id) else {
        return Ok(Envelope::job_status(client_id, job_id, Some(JobState::Deleted)));
    };

    let mut reply = Envelope::job_status(client_id, job_id, Some(job.state()));
    reply.error = job.error_message().map(str::to_string);
    Ok(reply)
}
