//! Job intake.
//!
//! A submission arrives on `setJob.<client>.<job>` with the script as its
//! body. New jobs enter the round-robin in WAITING.

use meteor_protocol::{Envelope, JobState};
use tracing::{info, warn};

use crate::job::ServerJob;
use crate::state::SchedulerState;

/// Enqueue a submitted job; returns the WAITING status to push.
///
/// A job that is already waiting or running is left alone. A finished or
/// failed job with the same id is replaced.
pub fn handle(state: &mut SchedulerState, client_id: &str, job_id: &str, script: String) -> Option<Envelope> {
    if state.is_active(client_id, job_id) {
        warn!(client_id, job_id, "duplicate submission ignored");
        return None;
    }
    if state.forget_finished(client_id, job_id).is_some() {
        info!(client_id, job_id, "resubmission replaces finished job");
    }

    if !state.round_robin.enqueue(ServerJob::new(client_id, job_id, script)) {
        return None;
    }
    info!(client_id, job_id, "job waiting");
    Some(Envelope::job_status(client_id, job_id, Some(JobState::Waiting)))
}
