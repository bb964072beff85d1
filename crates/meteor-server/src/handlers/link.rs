//! GET_LINK handler.

use meteor_protocol::{Envelope, ErrorCode, JobState, RequestCode};

use super::{file_index, job_ids};
use crate::error::RequestError;
use crate::job::ServerJob;
use crate::state::SchedulerState;

/// Resolve output `index` of a finished job.
pub(crate) fn output_path<'a>(
    state: &'a SchedulerState,
    client_id: &str,
    job_id: &str,
    index: usize,
) -> Result<&'a str, RequestError> {
    let job: &ServerJob = state
        .job(client_id, job_id)
        .ok_or_else(|| RequestError::job_not_found(client_id, job_id))?;
    if job.state() != JobState::Finished {
        return Err(RequestError::new(
            ErrorCode::JobNotFinished,
            format!("job {} is {}, not FINISHED", job_id, job.state()),
        ));
    }
    job.output_path(index).ok_or_else(|| {
        RequestError::new(
            ErrorCode::FileIndexOutOfRange,
            format!(
                "file index {} out of range, job {} has {} outputs",
                index,
                job_id,
                job.mapped_output_paths().len()
            ),
        )
    })
}

/// Reply with the stored path of one output.
pub fn handle(request: &Envelope, state: &SchedulerState) -> Result<Envelope, RequestError> {
    let (client_id, job_id) = job_ids(request)?;
    let index = file_index(request)?;
    let path = output_path(state, client_id, job_id, index)?;

    let mut reply = Envelope::get_link(client_id, job_id, index).with_path(path);
    reply.request_code = RequestCode::GetLink;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::state_with_finished;

    #[test]
    fn test_link_for_finished_output() {
        let state = state_with_finished("c1", "j1", &["file:///r/c1/a.json", "file:///r/c1/b.json"]);
        let reply = handle(&Envelope::get_link("c1", "j1", 1), &state).unwrap();
        assert_eq!(reply.path.as_deref(), Some("file:///r/c1/b.json"));
        assert_eq!(reply.file_index(), Some(1));
    }

    #[test]
    fn test_index_out_of_range() {
        let state = state_with_finished("c1", "j1", &["file:///r/c1/a.json"]);
        let err = handle(&Envelope::get_link("c1", "j1", 5), &state).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileIndexOutOfRange);
    }

    #[test]
    fn test_unknown_job() {
        let state = SchedulerState::new();
        let err = handle(&Envelope::get_link("c1", "j1", 0), &state).unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFound);
    }

    #[test]
    fn test_waiting_job_has_no_links() {
        let mut state = SchedulerState::new();
        state.round_robin.enqueue(ServerJob::new("c1", "j1", "s"));
        let err = handle(&Envelope::get_link("c1", "j1", 0), &state).unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFinished);
    }

    #[test]
    fn test_missing_index() {
        let state = state_with_finished("c1", "j1", &["a"]);
        let mut request = Envelope::get_link("c1", "j1", 0);
        request.file_index = None;
        let err = handle(&request, &state).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }
}
