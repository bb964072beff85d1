//! Server error types.

use meteor_bus::BusError;
use meteor_protocol::{Envelope, ErrorCode};

use crate::config::ConfigError;

/// Errors surfaced by the scheduler itself.
///
/// Nothing in the job-processing path produces one of these; they come
/// from bootstrap or from the broker going away.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler thread panicked")]
    ThreadPanicked,
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// A request the scheduler answers with an ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn job_not_found(client_id: &str, job_id: &str) -> Self {
        Self::new(
            ErrorCode::JobNotFound,
            format!("job {} of client {} not found", job_id, client_id),
        )
    }

    /// ERROR envelope addressed back to the requester.
    pub fn to_envelope(&self, request: &Envelope) -> Envelope {
        Envelope::error_reply(
            request.client_id.as_deref(),
            request.job_id.as_deref(),
            self.code,
            self.message.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_keeps_identifiers() {
        let request = Envelope::get_link("c1", "j1", 3);
        let env = RequestError::job_not_found("c1", "j1").to_envelope(&request);
        assert!(env.is_error());
        assert_eq!(env.client_id.as_deref(), Some("c1"));
        assert_eq!(env.job_id.as_deref(), Some("j1"));
        assert_eq!(env.error_code, Some(ErrorCode::JobNotFound));
        assert_eq!(env.error.as_deref(), Some("job j1 of client c1 not found"));
    }
}
