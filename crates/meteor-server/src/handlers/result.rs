//! REQUEST_RESULT handler.
//!
//! Resolves the output, opens it and negotiates the block layout. The
//! transfer itself runs on a sender thread (see `file_sender`).

use meteor_protocol::{BlockPlan, Envelope, ErrorCode};

use super::link::output_path;
use super::{file_index, job_ids};
use crate::error::RequestError;
use crate::file_sender::Transfer;
use crate::filesystem::{ByteSource, FsError};
use crate::state::SchedulerState;

pub fn handle(
    request: &Envelope,
    state: &SchedulerState,
    source: &dyn ByteSource,
    max_block_size: u64,
) -> Result<Transfer, RequestError> {
    let (client_id, job_id) = job_ids(request)?;
    let index = file_index(request)?;
    let (Some(desired), Some(max_blocks)) = (request.desired_block_size, request.maximum_number_of_blocks)
    else {
        return Err(RequestError::invalid_request(
            "REQUEST_RESULT needs DesiredBlockSize and MaximumNumberOfBlocks",
        ));
    };
    if desired <= 0 || max_blocks <= 0 {
        return Err(RequestError::new(
            ErrorCode::InvalidBlockRequest,
            format!("block size {} and block count {} must be positive", desired, max_blocks),
        ));
    }

    let path = output_path(state, client_id, job_id, index)?;
    let stream = source.open(path).map_err(|e| match e {
        FsError::NotFound(_) => RequestError::new(
            ErrorCode::SourceUnavailable,
            format!("output {} of job {} is missing", index, job_id),
        ),
        other => RequestError::new(ErrorCode::SourceUnavailable, other.to_string()),
    })?;

    let plan = BlockPlan::negotiate(stream.len, desired, max_blocks, max_block_size)
        .map_err(|e| RequestError::new(ErrorCode::InvalidBlockRequest, e.to_string()))?;

    Ok(Transfer {
        client_id: client_id.to_string(),
        job_id: job_id.to_string(),
        file_index: index,
        plan,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::MemoryFileSystem;
    use crate::handlers::test_support::state_with_finished;
    use meteor_protocol::MAX_BLOCK_SIZE;

    fn setup(content: &[u8]) -> (SchedulerState, MemoryFileSystem) {
        let state = state_with_finished("c1", "j1", &["mem://c1/out.json"]);
        let fs = MemoryFileSystem::new();
        fs.insert("mem://c1/out.json", content.to_vec());
        (state, fs)
    }

    #[test]
    fn test_negotiates_plan() {
        let (state, fs) = setup(&[7u8; 1050]);
        let request = Envelope::request_result("c1", "j1", 0, 100, 5);
        let transfer = handle(&request, &state, &fs, MAX_BLOCK_SIZE).unwrap();
        assert_eq!(transfer.plan.block_size, 210);
        assert_eq!(transfer.plan.total_blocks, 5);
        assert_eq!(transfer.file_index, 0);
    }

    #[test]
    fn test_non_positive_block_size() {
        let (state, fs) = setup(b"abc");
        let mut request = Envelope::request_result("c1", "j1", 0, 1, 1);
        request.desired_block_size = Some(0);
        let err = handle(&request, &state, &fs, MAX_BLOCK_SIZE).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidBlockRequest);
    }

    #[test]
    fn test_missing_source() {
        let (state, _) = setup(b"abc");
        let empty = MemoryFileSystem::new();
        let request = Envelope::request_result("c1", "j1", 0, 10, 10);
        let err = handle(&request, &state, &empty, MAX_BLOCK_SIZE).unwrap_err();
        assert_eq!(err.code, ErrorCode::SourceUnavailable);
    }

    #[test]
    fn test_unknown_index() {
        let (state, fs) = setup(b"abc");
        let request = Envelope::request_result("c1", "j1", 3, 10, 10);
        let err = handle(&request, &state, &fs, MAX_BLOCK_SIZE).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileIndexOutOfRange);
    }
}
