//! JOB_EXISTS handler.
//!
//! Answers with the job's current state, or UNDEFINED when the scheduler
//! holds no record of it.

use meteor_protocol::{Envelope, JobState, RequestCode};

use super::job_ids;
use crate::error::RequestError;
use crate::state::SchedulerState;

pub fn handle(request: &Envelope, state: &SchedulerState) -> Result<Envelope, RequestError> {
    let (client_id, job_id) = job_ids(request)?;
    let current = state.job_state(client_id, job_id).unwrap_or(JobState::Undefined);

    let mut reply = Envelope::job_status(client_id, job_id, Some(current));
    reply.request_code = RequestCode::JobExists;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::state_with_finished;
    use crate::job::ServerJob;

    #[test]
    fn test_unknown_job_is_undefined() {
        let state = SchedulerState::new();
        let reply = handle(&Envelope::job_exists("c1", "nope"), &state).unwrap();
        assert_eq!(reply.request_code, RequestCode::JobExists);
        assert_eq!(reply.job_status, Some(JobState::Undefined));
    }

    #[test]
    fn test_waiting_job_reports_waiting() {
        let mut state = SchedulerState::new();
        state.round_robin.enqueue(ServerJob::new("c1", "j1", "s"));
        let reply = handle(&Envelope::job_exists("c1", "j1"), &state).unwrap();
        assert_eq!(reply.job_status, Some(JobState::Waiting));
    }

    #[test]
    fn test_finished_job_reports_finished() {
        let state = state_with_finished("c1", "j1", &["/a.json"]);
        let reply = handle(&Envelope::job_exists("c1", "j1"), &state).unwrap();
        assert_eq!(reply.job_status, Some(JobState::Finished));
    }

    #[test]
    fn test_missing_ids_rejected() {
        let state = SchedulerState::new();
        let err = handle(&Envelope::new(RequestCode::JobExists), &state).unwrap_err();
        assert_eq!(err.code, meteor_protocol::ErrorCode::InvalidRequest);
    }
}
