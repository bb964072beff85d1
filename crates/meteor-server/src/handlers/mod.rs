//! Request handlers for the scheduler.
//!
//! Each inbound message kind has its own handler module. Request handlers
//! return the reply envelope; anything they cannot serve comes back as a
//! `RequestError` that the dispatcher turns into an ERROR reply.

pub mod abort;
pub mod exists;
pub mod link;
pub mod register;
pub mod result;
pub mod status;
pub mod submit;

use meteor_protocol::Envelope;

use crate::error::RequestError;

/// Client and job id of a request, both required.
pub(crate) fn job_ids(request: &Envelope) -> Result<(&str, &str), RequestError> {
    match (request.client_id.as_deref(), request.job_id.as_deref()) {
        (Some(client), Some(job)) if !client.is_empty() && !job.is_empty() => Ok((client, job)),
        _ => Err(RequestError::invalid_request(format!(
            "{} request needs ClientID and JobID",
            request.request_code
        ))),
    }
}

/// File index of a request, required and non-negative.
pub(crate) fn file_index(request: &Envelope) -> Result<usize, RequestError> {
    request.file_index().ok_or_else(|| {
        RequestError::invalid_request(format!(
            "{} request needs a non-negative FileIndex",
            request.request_code
        ))
    })
}
