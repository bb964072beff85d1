//! Server-side job record.

use chrono::{DateTime, Utc};
use meteor_protocol::JobState;

use crate::script::MappedScript;

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobState,
    pub to: JobState,
}

/// A job held by the scheduler.
#[derive(Debug, Clone)]
pub struct ServerJob {
    pub client_id: String,
    pub job_id: String,
    /// Script exactly as submitted.
    pub script: String,
    /// Script with output paths rewritten under the client's directory.
    pub mapped_script: Option<String>,
    pub submit_time: DateTime<Utc>,
    state: JobState,
    original_output_paths: Vec<String>,
    mapped_output_paths: Vec<String>,
    error_message: Option<String>,
}

impl ServerJob {
    /// New job in WAITING.
    pub fn new(client_id: impl Into<String>, job_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            job_id: job_id.into(),
            script: script.into(),
            mapped_script: None,
            submit_time: Utc::now(),
            state: JobState::Waiting,
            original_output_paths: Vec::new(),
            mapped_output_paths: Vec::new(),
            error_message: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn original_output_paths(&self) -> &[String] {
        &self.original_output_paths
    }

    pub fn mapped_output_paths(&self) -> &[String] {
        &self.mapped_output_paths
    }

    /// Stored location of output `index`.
    pub fn output_path(&self, index: usize) -> Option<&str> {
        self.mapped_output_paths.get(index).map(String::as_str)
    }

    pub fn key(&self) -> (String, String) {
        (self.client_id.clone(), self.job_id.clone())
    }

    pub fn set_state(&mut self, state: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(state) {
            return Err(TransitionError {
                job_id: self.job_id.clone(),
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        Ok(())
    }

    /// Record a failure and move to ERROR.
    pub fn set_error_message(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.set_state(JobState::Error)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Fail a job that cannot be started, whatever state it reached.
    pub(crate) fn mark_unstartable(&mut self, message: impl Into<String>) {
        self.state = JobState::Error;
        self.error_message = Some(message.into());
    }

    pub fn set_output_paths(&mut self, original: Vec<String>, mapped: Vec<String>) {
        self.original_output_paths = original;
        self.mapped_output_paths = mapped;
    }

    /// Adopt the result of path mapping.
    pub fn apply_mapping(&mut self, mapped: MappedScript) {
        self.mapped_script = Some(mapped.script);
        self.set_output_paths(mapped.original_outputs, mapped.mapped_outputs);
    }

    /// Script handed to the executor.
    pub fn executable_script(&self) -> &str {
        self.mapped_script.as_deref().unwrap_or(&self.script)
    }
}
