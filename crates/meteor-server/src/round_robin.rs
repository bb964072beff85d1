//! Round-robin fair scheduling across clients.
//!
//! Keeps one FIFO of pending jobs per client plus a cycle order of the
//! clients that currently have work. `next` serves the client at the head
//! of the cycle and, if it still has work, moves it to the tail.

use std::collections::{HashMap, VecDeque};

use crate::job::ServerJob;

type JobKey = (String, String);

#[derive(Debug, Default)]
pub struct RoundRobin {
    /// Clients with at least one pending job, in service order.
    cycle: VecDeque<String>,
    /// Pending job ids per registered client.
    queues: HashMap<String, VecDeque<String>>,
    index: HashMap<JobKey, ServerJob>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty queue for the client; no-op if it already has one.
    pub fn register_client(&mut self, client_id: &str) {
        self.queues.entry(client_id.to_string()).or_default();
    }

    /// Append a job to its client's queue.
    ///
    /// Returns false, leaving the scheduler untouched, if the same
    /// `(client, job)` pair is already pending.
    pub fn enqueue(&mut self, job: ServerJob) -> bool {
        let key = job.key();
        if self.index.contains_key(&key) {
            return false;
        }
        let queue = self.queues.entry(key.0.clone()).or_default();
        if queue.is_empty() {
            self.cycle.push_back(key.0.clone());
        }
        queue.push_back(key.1.clone());
        self.index.insert(key, job);
        true
    }

    /// Take the next job in fair order.
    pub fn next(&mut self) -> Option<ServerJob> {
        while let Some(client_id) = self.cycle.pop_front() {
            let Some(queue) = self.queues.get_mut(&client_id) else {
                continue;
            };
            let Some(job_id) = queue.pop_front() else {
                continue;
            };
            if !queue.is_empty() {
                self.cycle.push_back(client_id.clone());
            }
            if let Some(job) = self.index.remove(&(client_id, job_id)) {
                return Some(job);
            }
        }
        None
    }

    /// Drop a client and all of its pending jobs.
    pub fn remove_client(&mut self, client_id: &str) -> Vec<ServerJob> {
        self.cycle.retain(|c| c != client_id);
        let Some(queue) = self.queues.remove(client_id) else {
            return Vec::new();
        };
        queue
            .into_iter()
            .filter_map(|job_id| self.index.remove(&(client_id.to_string(), job_id)))
            .collect()
    }

    /// Drop one pending job.
    pub fn remove_job(&mut self, client_id: &str, job_id: &str) -> Option<ServerJob> {
        let job = self.index.remove(&(client_id.to_string(), job_id.to_string()))?;
        if let Some(queue) = self.queues.get_mut(client_id) {
            queue.retain(|j| j != job_id);
            if queue.is_empty() {
                self.cycle.retain(|c| c != client_id);
            }
        }
        Some(job)
    }

    pub fn contains(&self, client_id: &str, job_id: &str) -> bool {
        self.index
            .contains_key(&(client_id.to_string(), job_id.to_string()))
    }

    pub fn lookup(&self, client_id: &str, job_id: &str) -> Option<&ServerJob> {
        self.index.get(&(client_id.to_string(), job_id.to_string()))
    }

    pub fn is_client_registered(&self, client_id: &str) -> bool {
        self.queues.contains_key(client_id)
    }

    /// Number of pending jobs across all clients.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Clients with pending work, in the order they will be served.
    pub fn cycle_order(&self) -> Vec<&str> {
        self.cycle.iter().map(String::as_str).collect()
    }
}
