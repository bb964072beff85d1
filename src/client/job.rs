//! Client-side job mirror and state listeners.

use chrono::{DateTime, Utc};
use meteor_protocol::JobState;

/// Local view of a submitted job.
///
/// Starts in INITIALIZE, moves to SUBMIT once published; every later
/// state is taken verbatim from the scheduler's status pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJob {
    pub job_id: String,
    pub script: String,
    state: JobState,
    submit_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl ClientJob {
    pub fn new(job_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            script: script.into(),
            state: JobState::Initialize,
            submit_time: None,
            error_message: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn submit_time(&self) -> Option<DateTime<Utc>> {
        self.submit_time
    }

    /// Scheduler's error text, set once the job reached ERROR.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = JobState::Submit;
        self.submit_time = Some(Utc::now());
    }

    /// Apply a pushed state as-is.
    pub(crate) fn apply(&mut self, state: JobState, error: Option<&str>) {
        self.state = state;
        if state == JobState::Error {
            self.error_message = error.map(str::to_string);
        }
    }
}

/// Observer of one job's state changes.
///
/// Called on the status subscription thread, in delivery order. Must not
/// block: further status deliveries wait until it returns.
pub trait JobStateListener: Send + Sync {
    fn on_state_change(&self, job_id: &str, state: JobState);
}

impl<F> JobStateListener for F
where
    F: Fn(&str, JobState) + Send + Sync,
{
    fn on_state_change(&self, job_id: &str, state: JobState) {
        self(job_id, state)
    }
}

/// One observed status push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub job_id: String,
    pub state: JobState,
    pub error: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}
