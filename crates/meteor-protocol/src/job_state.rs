//! Job state machine
//!
//! Server lifecycle: WAITING → RUNNING → {FINISHED | ERROR}, with DELETED
//! reachable from any held state on abort. Clients additionally pass
//! through INITIALIZE → SUBMIT before the server takes over.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Job state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// No record of the job (existence queries only)
    Undefined,
    /// Blank client-side job object
    Initialize,
    /// Client published the job to the scheduler
    Submit,
    /// Sitting in the scheduler's round-robin queue
    Waiting,
    /// Handed to the query executor
    Running,
    /// Executor succeeded, output paths are available
    Finished,
    /// Executor raised a parse or execution error
    Error,
    /// Removed from the scheduler (abort or unknown job)
    Deleted,
}

impl JobState {
    /// All states, in declaration order.
    pub const ALL: [JobState; 8] = [
        JobState::Undefined,
        JobState::Initialize,
        JobState::Submit,
        JobState::Waiting,
        JobState::Running,
        JobState::Finished,
        JobState::Error,
        JobState::Deleted,
    ];

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Undefined => "UNDEFINED",
            JobState::Initialize => "INITIALIZE",
            JobState::Submit => "SUBMIT",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Error => "ERROR",
            JobState::Deleted => "DELETED",
        }
    }

    /// Human-readable description of the state.
    pub fn description(&self) -> &'static str {
        match self {
            JobState::Undefined => "Undefined job status.",
            JobState::Initialize => "Initialize blank job object.",
            JobState::Submit => "Job submitted to scheduler.",
            JobState::Waiting => "Job sitting on the waiting queue of the scheduler.",
            JobState::Running => "Job running.",
            JobState::Finished => "Job finished.",
            JobState::Error => "An error occurred.",
            JobState::Deleted => "Deleted from scheduler.",
        }
    }

    /// Returns true if no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Error | JobState::Deleted)
    }

    /// Returns true for states only ever reported in answers, never held by a live job.
    pub fn is_answer_only(&self) -> bool {
        matches!(self, JobState::Undefined | JobState::Deleted)
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: JobState) -> bool {
        match (self, target) {
            // Client-side creation
            (JobState::Initialize, JobState::Submit) => true,
            (JobState::Submit, JobState::Waiting) => true,

            // Scheduler lifecycle
            (JobState::Waiting, JobState::Running) => true,
            (JobState::Running, JobState::Finished) => true,
            (JobState::Running, JobState::Error) => true,

            // Abort removes the job whatever it was doing
            (
                JobState::Initialize
                | JobState::Submit
                | JobState::Waiting
                | JobState::Running
                | JobState::Finished
                | JobState::Error,
                JobState::Deleted,
            ) => true,

            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_string()))
    }
}

/// Returned when parsing a state name that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownJobState(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(JobState::Waiting.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Finished));
        assert!(JobState::Running.can_transition_to(JobState::Error));
    }

    #[test]
    fn test_no_transition_skips_running() {
        assert!(!JobState::Waiting.can_transition_to(JobState::Finished));
        assert!(!JobState::Waiting.can_transition_to(JobState::Error));
    }

    #[test]
    fn test_terminal_states_only_move_to_deleted() {
        for target in JobState::ALL {
            let allowed = JobState::Finished.can_transition_to(target);
            assert_eq!(allowed, target == JobState::Deleted, "FINISHED -> {}", target);
        }
        assert!(!JobState::Deleted.can_transition_to(JobState::Waiting));
        assert!(!JobState::Undefined.can_transition_to(JobState::Running));
    }

    #[test]
    fn test_wire_names_round_trip_through_from_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("PAUSED".parse::<JobState>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&JobState::Finished).unwrap();
        assert_eq!(json, "\"FINISHED\"");
    }

    #[test]
    fn test_answer_only_states() {
        assert!(JobState::Undefined.is_answer_only());
        assert!(JobState::Deleted.is_answer_only());
        assert!(!JobState::Running.is_answer_only());
    }
}
