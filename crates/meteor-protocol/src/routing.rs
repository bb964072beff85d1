//! Exchange names, routing keys and topic grammar.
//!
//! Submissions travel on `setJob.<clientId>.<jobId>`, ad-hoc requests on
//! `request`, and registration on `register.login` / `register.logoff`.
//! Status pushes go to the status exchange keyed by the client id.

/// Durable topic exchange carrying submissions, requests and registration.
pub const REQUEST_EXCHANGE: &str = "dopa.scheduler.exchange.request";

/// Transient direct exchange carrying status pushes, keyed by client id.
pub const STATUS_EXCHANGE: &str = "dopa.scheduler.exchange.status";

/// Durable queue the scheduler consumes.
pub const REQUEST_QUEUE: &str = "scheduler.requests.queue";

/// Binding pattern for job submissions.
pub const JOB_KEY_MASK: &str = "setJob.*.#";

/// Routing key for ad-hoc requests.
pub const REQUEST_KEY: &str = "request";

/// Binding pattern for registration messages.
pub const REGISTER_KEY_MASK: &str = "register.*";

pub const REGISTER_LOGIN: &str = "register.login";
pub const REGISTER_LOGOFF: &str = "register.logoff";

/// Priority of a login message sent with reconnect enabled.
pub const RECONNECT_PRIORITY: u8 = 10;

/// Header naming the status queue a login or logoff belongs to.
pub const STATUS_QUEUE_HEADER: &str = "x-status-queue";

/// Handshake reply body rejecting an already-registered client id.
pub const STILL_REGISTERED: &str = "Still registered!";

const JOB_TOPIC_PREFIX: &str = "setJob";

/// Topic a client publishes a job script on.
pub fn job_topic(client_id: &str, job_id: &str) -> String {
    format!("{}.{}.{}", JOB_TOPIC_PREFIX, client_id, job_id)
}

/// Routing key for status pushes to one client.
pub fn status_routing_key(client_id: &str) -> &str {
    client_id
}

/// Classification of a routing key on the request exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    JobSubmission { client_id: String, job_id: String },
    Request,
    Login,
    Logoff,
    Unknown(String),
}

impl Topic {
    pub fn parse(routing_key: &str) -> Self {
        match routing_key {
            REQUEST_KEY => return Topic::Request,
            REGISTER_LOGIN => return Topic::Login,
            REGISTER_LOGOFF => return Topic::Logoff,
            _ => {}
        }

        let mut parts = routing_key.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(JOB_TOPIC_PREFIX), Some(client), Some(job))
                if !client.is_empty() && !job.is_empty() =>
            {
                Topic::JobSubmission {
                    client_id: client.to_string(),
                    job_id: job.to_string(),
                }
            }
            _ => Topic::Unknown(routing_key.to_string()),
        }
    }
}

/// Reasons an identifier cannot be used in routing keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier '{id}' contains reserved character '{ch}'")]
    ReservedCharacter { id: String, ch: char },
}

/// Check that a client or job id can be embedded in a topic.
///
/// Ids must be non-empty and free of `.`, `*`, `#` and whitespace.
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty);
    }
    if let Some(ch) = id
        .chars()
        .find(|c| matches!(c, '.' | '*' | '#') || c.is_whitespace())
    {
        return Err(IdError::ReservedCharacter {
            id: id.to_string(),
            ch,
        });
    }
    Ok(())
}
