//! Dispatcher-owned job bookkeeping.
//!
//! A job lives in exactly one of three places: the round-robin (WAITING),
//! the running set, or the finished set (FINISHED / ERROR).

use std::collections::HashMap;

use meteor_protocol::JobState;

use crate::job::ServerJob;
use crate::round_robin::RoundRobin;

type JobKey = (String, String);

fn key(client_id: &str, job_id: &str) -> JobKey {
    (client_id.to_string(), job_id.to_string())
}

#[derive(Debug)]
pub struct RunningJob {
    pub job: ServerJob,
    pub ticket: u64,
}

#[derive(Debug, Default)]
pub struct SchedulerState {
    pub round_robin: RoundRobin,
    running: HashMap<JobKey, RunningJob>,
    finished: HashMap<JobKey, ServerJob>,
    next_ticket: u64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a job up wherever it currently lives.
    pub fn job(&self, client_id: &str, job_id: &str) -> Option<&ServerJob> {
        let k = key(client_id, job_id);
        self.round_robin
            .lookup(client_id, job_id)
            .or_else(|| self.running.get(&k).map(|r| &r.job))
            .or_else(|| self.finished.get(&k))
    }

    pub fn job_state(&self, client_id: &str, job_id: &str) -> Option<JobState> {
        self.job(client_id, job_id).map(ServerJob::state)
    }

    /// True while the job is waiting or running.
    pub fn is_active(&self, client_id: &str, job_id: &str) -> bool {
        self.round_robin.contains(client_id, job_id)
            || self.running.contains_key(&key(client_id, job_id))
    }

    /// Move a dequeued job into the running set; returns its run ticket.
    pub fn start(&mut self, job: ServerJob) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.running.insert(job.key(), RunningJob { job, ticket });
        ticket
    }

    /// Take a running job back if `ticket` is still its current run.
    pub fn take_running(&mut self, client_id: &str, job_id: &str, ticket: u64) -> Option<ServerJob> {
        let k = key(client_id, job_id);
        match self.running.get(&k) {
            Some(running) if running.ticket == ticket => self.running.remove(&k).map(|r| r.job),
            _ => None,
        }
    }

    pub fn finish(&mut self, job: ServerJob) {
        self.finished.insert(job.key(), job);
    }

    pub fn finished_job(&self, client_id: &str, job_id: &str) -> Option<&ServerJob> {
        self.finished.get(&key(client_id, job_id))
    }

    pub fn forget_finished(&mut self, client_id: &str, job_id: &str) -> Option<ServerJob> {
        self.finished.remove(&key(client_id, job_id))
    }

    /// Remove a job from every set.
    pub fn remove(&mut self, client_id: &str, job_id: &str) -> Option<ServerJob> {
        let k = key(client_id, job_id);
        self.round_robin
            .remove_job(client_id, job_id)
            .or_else(|| self.running.remove(&k).map(|r| r.job))
            .or_else(|| self.finished.remove(&k))
    }

    pub fn pending_count(&self) -> usize {
        self.round_robin.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }
}
