//! Structured request/response envelope.
//!
//! Every request, status push and reply on the bus that is not a raw
//! result block is a JSON object with a `RequestCode` and a handful of
//! optional fields. Parsing never panics: anything that is not a
//! well-formed envelope yields `None`.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::job_state::JobState;

/// Kind of request (or reply) an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestCode {
    /// Existence query; answered with a JobStatus.
    JobExists,
    /// Status query; also used for status pushes.
    JobStatus,
    /// Remove the job from the scheduler.
    JobAbort,
    /// Ask for the stored path of one output.
    GetLink,
    /// Start a chunked transfer of one output.
    RequestResult,
    /// Error reply or status push.
    Error,
}

impl RequestCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCode::JobExists => "JOB_EXISTS",
            RequestCode::JobStatus => "JOB_STATUS",
            RequestCode::JobAbort => "JOB_ABORT",
            RequestCode::GetLink => "GET_LINK",
            RequestCode::RequestResult => "REQUEST_RESULT",
            RequestCode::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for RequestCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured message exchanged between clients and the scheduler.
///
/// Field presence depends on the request code; absent fields are
/// omitted from the encoded JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "RequestCode")]
    pub request_code: RequestCode,
    #[serde(rename = "ClientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "JobID", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(rename = "FileIndex", default, skip_serializing_if = "Option::is_none")]
    pub file_index: Option<i64>,
    #[serde(rename = "DesiredBlockSize", default, skip_serializing_if = "Option::is_none")]
    pub desired_block_size: Option<i64>,
    #[serde(
        rename = "MaximumNumberOfBlocks",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub maximum_number_of_blocks: Option<i64>,
    #[serde(rename = "JobStatus", default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobState>,
    #[serde(rename = "Path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "ErrorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl Envelope {
    /// Blank envelope with only the request code set.
    pub fn new(request_code: RequestCode) -> Self {
        Self {
            request_code,
            client_id: None,
            job_id: None,
            file_index: None,
            desired_block_size: None,
            maximum_number_of_blocks: None,
            job_status: None,
            path: None,
            error: None,
            error_code: None,
        }
    }

    fn for_job(request_code: RequestCode, client_id: &str, job_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            job_id: Some(job_id.to_string()),
            ..Self::new(request_code)
        }
    }

    pub fn job_exists(client_id: &str, job_id: &str) -> Self {
        Self::for_job(RequestCode::JobExists, client_id, job_id)
    }

    /// Status query (no state) or status push/answer (with state).
    pub fn job_status(client_id: &str, job_id: &str, state: Option<JobState>) -> Self {
        Self {
            job_status: state,
            ..Self::for_job(RequestCode::JobStatus, client_id, job_id)
        }
    }

    pub fn job_abort(client_id: &str, job_id: &str) -> Self {
        Self::for_job(RequestCode::JobAbort, client_id, job_id)
    }

    pub fn get_link(client_id: &str, job_id: &str, file_index: usize) -> Self {
        Self {
            file_index: Some(file_index as i64),
            ..Self::for_job(RequestCode::GetLink, client_id, job_id)
        }
    }

    pub fn request_result(
        client_id: &str,
        job_id: &str,
        file_index: usize,
        desired_block_size: u64,
        maximum_number_of_blocks: u64,
    ) -> Self {
        Self {
            file_index: Some(file_index as i64),
            desired_block_size: Some(desired_block_size.min(i64::MAX as u64) as i64),
            maximum_number_of_blocks: Some(maximum_number_of_blocks.min(i64::MAX as u64) as i64),
            ..Self::for_job(RequestCode::RequestResult, client_id, job_id)
        }
    }

    /// ERROR envelope reporting a failed job (state ERROR plus the message).
    pub fn job_error(client_id: &str, job_id: &str, message: &str) -> Self {
        Self {
            job_status: Some(JobState::Error),
            error: Some(message.to_string()),
            ..Self::for_job(RequestCode::Error, client_id, job_id)
        }
    }

    /// ERROR reply to a request the scheduler could not serve.
    pub fn error_reply(
        client_id: Option<&str>,
        job_id: Option<&str>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            job_id: job_id.map(str::to_string),
            error: Some(message.into()),
            error_code: Some(code),
            ..Self::new(RequestCode::Error)
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Parse an envelope from raw bytes.
    ///
    /// Returns `None` for non-JSON input, a missing or unknown request
    /// code, or fields of the wrong type.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Parse an envelope from text.
    pub fn parse_str(text: &str) -> Option<Self> {
        Self::parse(text.as_bytes())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn is_error(&self) -> bool {
        self.request_code == RequestCode::Error
    }

    /// Job state carried by a status-bearing envelope.
    ///
    /// ERROR envelopes without an explicit state count as ERROR.
    pub fn effective_state(&self) -> Option<JobState> {
        match (self.request_code, self.job_status) {
            (_, Some(state)) => Some(state),
            (RequestCode::Error, None) => Some(JobState::Error),
            _ => None,
        }
    }

    /// File index as an unsigned position, if present and non-negative.
    pub fn file_index(&self) -> Option<usize> {
        self.file_index.and_then(|i| usize::try_from(i).ok())
    }
}
