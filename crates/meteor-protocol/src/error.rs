//! Error codes carried by ERROR envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes attached to ERROR replies from the scheduler.
///
/// These codes are stable and used for automation; the human-readable
/// text travels separately in the envelope's `Error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope, unknown request code or missing identifiers.
    InvalidRequest,
    /// The named job is not held by the scheduler.
    JobNotFound,
    /// Output paths were requested for a job that has not finished.
    JobNotFinished,
    /// The file index does not name one of the job's outputs.
    FileIndexOutOfRange,
    /// The output could not be opened or read.
    SourceUnavailable,
    /// Block size or block count is not positive.
    InvalidBlockRequest,
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::JobNotFinished => "JOB_NOT_FINISHED",
            Self::FileIndexOutOfRange => "FILE_INDEX_OUT_OF_RANGE",
            Self::SourceUnavailable => "SOURCE_UNAVAILABLE",
            Self::InvalidBlockRequest => "INVALID_BLOCK_REQUEST",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
