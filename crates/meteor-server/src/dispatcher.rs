//! Scheduler dispatcher loop.
//!
//! One tick: take at most one inbound message and handle it, apply every
//! finished worker outcome, then start at most one waiting job if a slot
//! is free. All job state is owned by this loop; workers only send
//! outcomes back over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use meteor_bus::{Broker, BusError};
use meteor_protocol::{Envelope, JobState, RequestCode};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{RequestError, Result, ServerError};
use crate::executor::{spawn_worker, ExecutorError, JobOutcome, QueryExecutor};
use crate::file_sender;
use crate::filesystem::FileSystems;
use crate::handlers::{abort, exists, link, register, result, status, submit};
use crate::job::ServerJob;
use crate::script::ScriptMapper;
use crate::session::{Inbound, Replier, ServerSession};
use crate::state::SchedulerState;

pub struct Scheduler {
    session: ServerSession,
    config: ServerConfig,
    executor: Arc<dyn QueryExecutor>,
    filesystems: Arc<FileSystems>,
    mapper: ScriptMapper,
    state: SchedulerState,
    outcomes_tx: Sender<JobOutcome>,
    outcomes_rx: Receiver<JobOutcome>,
}

impl Scheduler {
    /// Open the server session and set up an empty scheduler.
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ServerConfig,
        executor: Arc<dyn QueryExecutor>,
        filesystems: FileSystems,
    ) -> Result<Self> {
        config.validate()?;
        let session = ServerSession::open(broker, &config)?;
        let (outcomes_tx, outcomes_rx) = mpsc::channel();
        Ok(Self {
            session,
            mapper: ScriptMapper::new(config.filesystem_root.clone()),
            config,
            executor,
            filesystems: Arc::new(filesystems),
            state: SchedulerState::new(),
            outcomes_tx,
            outcomes_rx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// One dispatcher iteration.
    ///
    /// Only broker failures are returned; everything else is answered on
    /// the bus or logged.
    pub fn tick(&mut self) -> Result<()> {
        if let Some(inbound) = self.session.receive(self.config.poll_timeout())? {
            self.handle_inbound(inbound);
        }
        self.drain_outcomes();
        if self.state.running_count() < self.config.max_concurrent_jobs {
            self.start_next();
        }
        Ok(())
    }

    /// Tick until `running` is cleared or the broker goes away.
    pub fn run(&mut self, running: &AtomicBool) {
        info!("scheduler running");
        while running.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(()) => {}
                Err(ServerError::Bus(BusError::Closed)) | Err(ServerError::Bus(BusError::QueueNotFound(_))) => {
                    error!("request queue gone, scheduler stopping");
                    break;
                }
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
        }
        info!("scheduler stopped");
    }

    /// Run the loop on its own thread.
    pub fn spawn(mut self) -> Result<SchedulerHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = thread::Builder::new()
            .name("meteor-scheduler".to_string())
            .spawn(move || {
                self.run(&flag);
                self
            })?;
        Ok(SchedulerHandle {
            running,
            thread: Some(thread),
        })
    }

    pub fn job_state(&self, client_id: &str, job_id: &str) -> Option<JobState> {
        self.state.job_state(client_id, job_id)
    }

    pub fn job(&self, client_id: &str, job_id: &str) -> Option<&ServerJob> {
        self.state.job(client_id, job_id)
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.session.is_registered(client_id)
    }

    pub fn pending_jobs(&self) -> usize {
        self.state.pending_count()
    }

    pub fn running_jobs(&self) -> usize {
        self.state.running_count()
    }

    pub fn finished_jobs(&self) -> usize {
        self.state.finished_count()
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Login {
                client_id,
                reconnect,
                status_queue,
                reply,
            } => {
                let status_queue = status_queue.as_deref();
                if let Err(e) =
                    register::login(&mut self.session, &mut self.state, &client_id, status_queue, reconnect, &reply)
                {
                    error!(client_id = %client_id, error = %e, "handshake reply failed");
                }
            }
            Inbound::Logoff { client_id, status_queue } => {
                register::logoff(&mut self.session, &client_id, status_queue.as_deref())
            }
            Inbound::JobSubmission {
                client_id,
                job_id,
                script,
            } => {
                if let Some(push) = submit::handle(&mut self.state, &client_id, &job_id, script) {
                    self.push_status(&client_id, &push);
                }
            }
            Inbound::Request { envelope, reply } => self.handle_request(envelope, reply),
            Inbound::Malformed { routing_key, reason } => {
                warn!(routing_key = %routing_key, reason = %reason, "dropped inbound message");
            }
        }
    }

    fn handle_request(&mut self, request: Envelope, reply: Option<Replier>) {
        let Some(reply) = reply else {
            warn!(request = %request.request_code, "request without reply address dropped");
            return;
        };

        let answer: std::result::Result<Envelope, RequestError> = match request.request_code {
            RequestCode::JobExists => exists::handle(&request, &self.state),
            RequestCode::JobStatus => status::handle(&request, &self.state),
            RequestCode::JobAbort => {
                let answer = abort::handle(&request, &mut self.state);
                if let Ok(deleted) = &answer {
                    if let Some(client_id) = deleted.client_id.clone() {
                        self.push_status(&client_id, deleted);
                    }
                }
                answer
            }
            RequestCode::GetLink => link::handle(&request, &self.state),
            RequestCode::RequestResult => {
                match result::handle(&request, &self.state, self.filesystems.as_ref(), self.config.max_block_size) {
                    Ok(transfer) => {
                        debug!(
                            client_id = %transfer.client_id,
                            job_id = %transfer.job_id,
                            blocks = transfer.plan.total_blocks,
                            "starting result transfer"
                        );
                        if let Err(e) = file_sender::spawn(reply, transfer) {
                            error!(error = %e, "could not start result sender");
                        }
                        return;
                    }
                    Err(e) => Err(e),
                }
            }
            RequestCode::Error => Err(RequestError::invalid_request("ERROR is not a request")),
        };

        let envelope = match answer {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(request = %request.request_code, error = %e, "request rejected");
                e.to_envelope(&request)
            }
        };
        if let Err(e) = reply.reply(&envelope) {
            error!(error = %e, "reply failed");
        }
    }

    fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            self.apply_outcome(outcome);
        }
    }

    fn apply_outcome(&mut self, outcome: JobOutcome) {
        let JobOutcome {
            client_id,
            job_id,
            ticket,
            result,
        } = outcome;
        let Some(mut job) = self.state.take_running(&client_id, &job_id, ticket) else {
            debug!(client_id = %client_id, job_id = %job_id, ticket, "outcome of aborted run discarded");
            return;
        };

        let push = match result {
            Ok(paths) => {
                if !paths.is_empty() {
                    let original = job.original_output_paths().to_vec();
                    job.set_output_paths(original, paths);
                }
                match job.set_state(JobState::Finished) {
                    Ok(()) => {
                        info!(client_id = %client_id, job_id = %job_id, outputs = job.mapped_output_paths().len(), "job finished");
                        Envelope::job_status(&client_id, &job_id, Some(JobState::Finished))
                    }
                    Err(e) => {
                        error!(error = %e, "finished job in unexpected state");
                        return;
                    }
                }
            }
            Err(e) => self.fail(&mut job, &e),
        };
        self.state.finish(job);
        self.push_status(&client_id, &push);
    }

    fn fail(&self, job: &mut ServerJob, e: &ExecutorError) -> Envelope {
        let message = e.job_message();
        if let Err(te) = job.set_error_message(message.clone()) {
            error!(error = %te, "failed job in unexpected state");
        }
        warn!(client_id = %job.client_id, job_id = %job.job_id, error = %message, "job failed");
        Envelope::job_error(&job.client_id, &job.job_id, &message)
    }

    fn start_next(&mut self) {
        let Some(mut job) = self.state.round_robin.next() else {
            return;
        };
        if let Err(e) = job.set_state(JobState::Running) {
            error!(error = %e, "dequeued job not waiting");
            let message = ExecutorError::Execution(e.to_string()).job_message();
            job.mark_unstartable(message.clone());
            let push = Envelope::job_error(&job.client_id, &job.job_id, &message);
            let client_id = job.client_id.clone();
            self.state.finish(job);
            self.push_status(&client_id, &push);
            return;
        }
        info!(client_id = %job.client_id, job_id = %job.job_id, "job running");
        self.push_status(
            &job.client_id,
            &Envelope::job_status(&job.client_id, &job.job_id, Some(JobState::Running)),
        );

        match self.mapper.map(&job.client_id, &job.script) {
            Ok(mapped) => job.apply_mapping(mapped),
            Err(e) => {
                let push = self.fail(&mut job, &ExecutorError::Parse(e.to_string()));
                let client_id = job.client_id.clone();
                self.state.finish(job);
                self.push_status(&client_id, &push);
                return;
            }
        }

        let client_id = job.client_id.clone();
        let job_id = job.job_id.clone();
        let script = job.executable_script().to_string();
        let ticket = self.state.start(job);

        if let Err(e) = spawn_worker(
            self.executor.clone(),
            client_id.clone(),
            job_id.clone(),
            ticket,
            script,
            self.outcomes_tx.clone(),
        ) {
            error!(client_id = %client_id, job_id = %job_id, error = %e, "could not start worker");
            self.apply_outcome(JobOutcome {
                client_id,
                job_id,
                ticket,
                result: Err(ExecutorError::Execution(e.to_string())),
            });
        }
    }

    fn push_status(&self, client_id: &str, status: &Envelope) {
        if let Err(e) = self.session.send_job_status(client_id, status) {
            error!(client_id, error = %e, "status push failed");
        }
    }
}

/// Handle to a scheduler running on its own thread.
pub struct SchedulerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Scheduler>>,
}

impl SchedulerHandle {
    /// Stop the loop and hand the scheduler back for inspection.
    pub fn shutdown(mut self) -> Result<Scheduler> {
        self.running.store(false, Ordering::SeqCst);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::ThreadPanicked),
            None => Err(ServerError::ThreadPanicked),
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_bus::{AckMode, MemoryBroker, Message, QueueOptions};
    use meteor_protocol::routing;
    use std::time::{Duration, Instant};

    fn scheduler(broker: &MemoryBroker, executor: Arc<dyn QueryExecutor>) -> Scheduler {
        let config = ServerConfig {
            poll_timeout_ms: 5,
            max_concurrent_jobs: 1,
            filesystem_root: "file:///r/".into(),
            ..ServerConfig::default()
        };
        Scheduler::new(Arc::new(broker.clone()), config, executor, FileSystems::new()).unwrap()
    }

    fn status_queue(broker: &MemoryBroker, client: &str) -> String {
        let q = broker.declare_queue(QueueOptions::anonymous()).unwrap();
        broker.bind_queue(&q, routing::STATUS_EXCHANGE, client).unwrap();
        q
    }

    fn states(broker: &MemoryBroker, q: &str) -> Vec<JobState> {
        let mut out = Vec::new();
        while let Some(d) = broker.receive(q, Duration::ZERO, AckMode::Auto).unwrap() {
            out.extend(Envelope::parse(&d.body).and_then(|e| e.effective_state()));
        }
        out
    }

    fn tick_until(s: &mut Scheduler, done: impl Fn(&Scheduler) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(s) {
            assert!(Instant::now() < deadline, "scheduler did not settle");
            s.tick().unwrap();
        }
    }

    fn submit(broker: &MemoryBroker, client: &str, job: &str, script: &str) {
        broker
            .publish(routing::REQUEST_EXCHANGE, &routing::job_topic(client, job), Message::new(script))
            .unwrap();
    }

    #[test]
    fn test_job_runs_to_finished() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> =
            Arc::new(|_: &str| -> std::result::Result<Vec<String>, ExecutorError> { Ok(vec![]) });
        let mut s = scheduler(&broker, exec);
        let q = status_queue(&broker, "alice");

        submit(&broker, "alice", "j1", "write $o to '/out.json';");
        tick_until(&mut s, |s| s.job_state("alice", "j1") == Some(JobState::Finished));

        assert_eq!(states(&broker, &q), vec![JobState::Waiting, JobState::Running, JobState::Finished]);
        let job = s.job("alice", "j1").unwrap();
        assert_eq!(job.output_path(0), Some("file:///r/alice/out.json"));
        assert_eq!(job.original_output_paths(), &["/out.json".to_string()]);
    }

    #[test]
    fn test_executor_paths_replace_mapped_outputs() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> = Arc::new(|_: &str| -> std::result::Result<Vec<String>, ExecutorError> {
            Ok(vec!["file:///elsewhere/x.json".into()])
        });
        let mut s = scheduler(&broker, exec);
        submit(&broker, "alice", "j1", "write $o to '/out.json';");
        tick_until(&mut s, |s| s.finished_jobs() == 1);
        assert_eq!(s.job("alice", "j1").unwrap().output_path(0), Some("file:///elsewhere/x.json"));
    }

    #[test]
    fn test_executor_error_moves_running_to_error() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> = Arc::new(|_: &str| -> std::result::Result<Vec<String>, ExecutorError> {
            Err(ExecutorError::Parse("unexpected token".into()))
        });
        let mut s = scheduler(&broker, exec);
        let q = status_queue(&broker, "alice");

        submit(&broker, "alice", "j1", "garbage");
        tick_until(&mut s, |s| s.job_state("alice", "j1") == Some(JobState::Error));

        assert_eq!(states(&broker, &q), vec![JobState::Waiting, JobState::Running, JobState::Error]);
        assert_eq!(
            s.job("alice", "j1").unwrap().error_message(),
            Some("Cannot parse the script of your job. unexpected token")
        );
    }

    #[test]
    fn test_unmappable_script_fails_after_running() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> =
            Arc::new(|_: &str| -> std::result::Result<Vec<String>, ExecutorError> { Ok(vec![]) });
        let mut s = scheduler(&broker, exec);
        let q = status_queue(&broker, "alice");

        submit(&broker, "alice", "j1", "write $o to '../bob/x.json';");
        tick_until(&mut s, |s| s.finished_jobs() == 1);
        assert_eq!(states(&broker, &q), vec![JobState::Waiting, JobState::Running, JobState::Error]);
    }

    #[test]
    fn test_panicking_executor_frees_its_slot() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> = Arc::new(|script: &str| -> std::result::Result<Vec<String>, ExecutorError> {
            if script == "bad" {
                panic!("executor bug");
            }
            Ok(vec![])
        });
        let mut s = scheduler(&broker, exec);
        let q = status_queue(&broker, "alice");

        submit(&broker, "alice", "bad", "bad");
        submit(&broker, "alice", "good", "good");
        tick_until(&mut s, |s| s.job_state("alice", "good") == Some(JobState::Finished));

        assert_eq!(s.job_state("alice", "bad"), Some(JobState::Error));
        assert_eq!(
            s.job("alice", "bad").unwrap().error_message(),
            Some("Cannot execute your job. executor panicked: executor bug")
        );
        assert_eq!(s.running_jobs(), 0);
        assert_eq!(
            states(&broker, &q),
            vec![
                JobState::Waiting,
                JobState::Running,
                JobState::Waiting,
                JobState::Error,
                JobState::Running,
                JobState::Finished,
            ]
        );
    }

    #[test]
    fn test_unstartable_job_is_failed_not_dropped() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> =
            Arc::new(|_: &str| -> std::result::Result<Vec<String>, ExecutorError> { Ok(vec![]) });
        let mut s = scheduler(&broker, exec);
        let q = status_queue(&broker, "alice");

        let mut job = ServerJob::new("alice", "j1", "s");
        job.set_state(JobState::Running).unwrap();
        s.state.round_robin.enqueue(job);
        s.tick().unwrap();

        assert_eq!(s.pending_jobs(), 0);
        assert_eq!(s.finished_jobs(), 1);
        assert_eq!(s.job_state("alice", "j1"), Some(JobState::Error));
        assert_eq!(states(&broker, &q), vec![JobState::Error]);
    }

    #[test]
    fn test_one_job_started_per_tick() {
        let broker = MemoryBroker::new();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let exec: Arc<dyn QueryExecutor> = Arc::new(move |_: &str| -> std::result::Result<Vec<String>, ExecutorError> {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(vec![])
        });
        let mut s = scheduler(&broker, exec);
        submit(&broker, "alice", "j1", "s");
        submit(&broker, "bob", "j1", "s");

        s.tick().unwrap();
        assert_eq!(s.running_jobs(), 1);
        s.tick().unwrap();
        assert_eq!(s.pending_jobs(), 1);
        assert_eq!(s.running_jobs(), 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        tick_until(&mut s, |s| s.finished_jobs() == 2);
    }

    #[test]
    fn test_spawned_scheduler_shuts_down() {
        let broker = MemoryBroker::new();
        let exec: Arc<dyn QueryExecutor> =
            Arc::new(|_: &str| -> std::result::Result<Vec<String>, ExecutorError> { Ok(vec![]) });
        let handle = scheduler(&broker, exec).spawn().unwrap();
        submit(&broker, "alice", "j1", "s");
        std::thread::sleep(Duration::from_millis(300));
        let s = handle.shutdown().unwrap();
        assert_eq!(s.job_state("alice", "j1"), Some(JobState::Finished));
    }
}
