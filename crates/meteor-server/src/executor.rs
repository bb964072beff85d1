//! Query executor contract and job workers.
//!
//! The executor turns a script into a list of output paths. Each running
//! job gets its own worker thread; the worker reports back over a channel
//! that the dispatcher drains, so only the dispatcher writes job state.

use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::config::ExecutorCommand;

/// Exit status a command executor uses to signal a script parse error.
pub const PARSE_ERROR_EXIT_CODE: i32 = 2;

/// Failure raised by an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("execution error: {0}")]
    Execution(String),
}

impl ExecutorError {
    /// Message recorded on the failed job.
    pub fn job_message(&self) -> String {
        match self {
            ExecutorError::Parse(detail) => format!("Cannot parse the script of your job. {}", detail),
            ExecutorError::Execution(detail) => format!("Cannot execute your job. {}", detail),
        }
    }
}

/// Runs job scripts.
pub trait QueryExecutor: Send + Sync {
    /// Execute a script and return the paths of its outputs.
    fn execute(&self, script: &str) -> Result<Vec<String>, ExecutorError>;
}

impl<F> QueryExecutor for F
where
    F: Fn(&str) -> Result<Vec<String>, ExecutorError> + Send + Sync,
{
    fn execute(&self, script: &str) -> Result<Vec<String>, ExecutorError> {
        self(script)
    }
}

/// Executor that pipes the script into an external program.
///
/// Each non-empty line of stdout is an output path. Exit code 2 means
/// the script did not parse; any other failure is an execution error.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(command: &ExecutorCommand) -> Self {
        Self::new(command.program.clone(), command.args.clone())
    }
}

impl QueryExecutor for CommandExecutor {
    fn execute(&self, script: &str) -> Result<Vec<String>, ExecutorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Execution(format!("failed to start {}: {}", self.program, e)))?;

        // stdin is fed from its own thread while stdout and stderr drain here
        let stdin = child.stdin.take();
        let input = script.as_bytes().to_vec();
        let writer = thread::Builder::new()
            .name("meteor-exec-stdin".to_string())
            .spawn(move || -> io::Result<()> {
                match stdin {
                    Some(mut stdin) => stdin.write_all(&input),
                    None => Ok(()),
                }
            });
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecutorError::Execution(format!("failed to pass script: {}", e)));
            }
        };

        let output = child
            .wait_with_output()
            .map_err(|e| ExecutorError::Execution(format!("failed to wait for {}: {}", self.program, e)))?;
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "script writer panicked")));

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(PARSE_ERROR_EXIT_CODE) => ExecutorError::Parse(stderr),
                Some(code) => ExecutorError::Execution(format!("exit code {}: {}", code, stderr)),
                None => ExecutorError::Execution(format!("terminated by signal: {}", stderr)),
            });
        }

        // a child that exits without reading its whole script is not an error
        if let Err(e) = written.or_else(|e| if e.kind() == io::ErrorKind::BrokenPipe { Ok(()) } else { Err(e) }) {
            return Err(ExecutorError::Execution(format!("failed to pass script: {}", e)));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Result of one job execution, sent back to the dispatcher.
#[derive(Debug)]
pub struct JobOutcome {
    pub client_id: String,
    pub job_id: String,
    /// Identifies the run; outcomes of aborted runs carry a stale ticket.
    pub ticket: u64,
    pub result: Result<Vec<String>, ExecutorError>,
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown cause".to_string()
    }
}

/// Run one job on its own thread.
///
/// A panicking executor is reported as an execution error.
pub fn spawn_worker(
    executor: Arc<dyn QueryExecutor>,
    client_id: String,
    job_id: String,
    ticket: u64,
    script: String,
    outcomes: Sender<JobOutcome>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("meteor-job-{}", job_id))
        .spawn(move || {
            debug!(client_id = %client_id, job_id = %job_id, ticket, "worker started");
            let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&script)))
                .unwrap_or_else(|payload| {
                    let detail = panic_detail(payload.as_ref());
                    warn!(client_id = %client_id, job_id = %job_id, detail = %detail, "executor panicked");
                    Err(ExecutorError::Execution(format!("executor panicked: {}", detail)))
                });
            let outcome = JobOutcome {
                client_id,
                job_id,
                ticket,
                result,
            };
            if outcomes.send(outcome).is_err() {
                debug!(ticket, "scheduler gone, outcome dropped");
            }
        })
}
