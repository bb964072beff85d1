//! Standing status subscription.
//!
//! One thread per session drains the private status queue, applies each
//! push to the job mirror, calls the job's listeners and buffers the update
//! for `next_status`. The thread ends when the queue is deleted.

use std::collections::HashMap;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use meteor_bus::{AckMode, Broker, BusError, Delivery};
use meteor_protocol::Envelope;
use tracing::{debug, error, info, warn};

use super::job::{ClientJob, JobStateListener, StatusUpdate};

const POLL: Duration = Duration::from_millis(100);

/// Job mirrors and listeners shared between the session and its status thread.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: Mutex<HashMap<String, ClientJob>>,
    listeners: Mutex<HashMap<String, Vec<Arc<dyn JobStateListener>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobTable {
    pub fn insert(&self, job: ClientJob) {
        lock(&self.jobs).insert(job.job_id.clone(), job);
    }

    pub fn remove(&self, job_id: &str) -> Option<ClientJob> {
        lock(&self.jobs).remove(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<ClientJob> {
        lock(&self.jobs).get(job_id).cloned()
    }

    pub fn update(&self, job_id: &str, f: impl FnOnce(&mut ClientJob)) -> bool {
        match lock(&self.jobs).get_mut(job_id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.jobs).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn add_listener(&self, job_id: &str, listener: Arc<dyn JobStateListener>) {
        lock(&self.listeners)
            .entry(job_id.to_string())
            .or_default()
            .push(listener);
    }

    pub fn clear_listeners(&self, job_id: &str) {
        lock(&self.listeners).remove(job_id);
    }

    /// Listeners of a job, copied so callbacks run without the lock held.
    fn listeners_of(&self, job_id: &str) -> Vec<Arc<dyn JobStateListener>> {
        lock(&self.listeners).get(job_id).cloned().unwrap_or_default()
    }

    /// Apply one pushed state and notify listeners.
    pub fn apply(&self, update: &StatusUpdate) {
        let known = self.update(&update.job_id, |job| job.apply(update.state, update.error.as_deref()));
        if !known {
            debug!(job_id = %update.job_id, state = %update.state, "status for job not submitted by this session");
        }
        for listener in self.listeners_of(&update.job_id) {
            listener.on_state_change(&update.job_id, update.state);
        }
    }
}

/// Decode a status push; `None` for anything that is not one.
pub(crate) fn decode(delivery: &Delivery) -> Option<StatusUpdate> {
    let envelope = Envelope::parse(&delivery.body)?;
    let state = envelope.effective_state()?;
    Some(StatusUpdate {
        job_id: envelope.job_id?,
        state,
        error: envelope.error,
        timestamp: delivery.properties.timestamp,
    })
}

/// Body of the status thread.
pub(crate) fn run(
    broker: Arc<dyn Broker>,
    queue: String,
    client_id: String,
    table: Arc<JobTable>,
    backlog: SyncSender<StatusUpdate>,
) {
    debug!(client_id = %client_id, queue = %queue, "status subscription started");
    loop {
        let delivery = match broker.receive(&queue, POLL, AckMode::Auto) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(BusError::QueueNotFound(_)) | Err(BusError::Closed) => break,
            Err(e) => {
                error!(client_id = %client_id, error = %e, "status subscription failed");
                break;
            }
        };

        let Some(update) = decode(&delivery) else {
            warn!(client_id = %client_id, routing_key = %delivery.routing_key, "unparseable status push dropped");
            continue;
        };
        info!(client_id = %client_id, job_id = %update.job_id, state = %update.state, "job state changed");
        table.apply(&update);

        match backlog.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(client_id = %client_id, job_id = %update.job_id, "status backlog full, update dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
    debug!(client_id = %client_id, "status subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_bus::Properties;
    use meteor_protocol::JobState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delivery(envelope: &Envelope) -> Delivery {
        Delivery {
            exchange: "status".into(),
            routing_key: "alice".into(),
            delivery_tag: 1,
            redelivered: false,
            properties: Properties::default(),
            body: envelope.to_bytes().unwrap(),
        }
    }

    #[test]
    fn test_decode_error_push() {
        let update = decode(&delivery(&Envelope::job_error("alice", "j1", "Cannot execute your job. x"))).unwrap();
        assert_eq!(update.state, JobState::Error);
        assert_eq!(update.error.as_deref(), Some("Cannot execute your job. x"));
    }

    #[test]
    fn test_decode_ignores_stateless_envelope() {
        assert!(decode(&delivery(&Envelope::job_exists("alice", "j1"))).is_none());
    }

    #[test]
    fn test_apply_updates_mirror_and_listeners_in_order() {
        let table = JobTable::default();
        let mut job = ClientJob::new("j1", "s");
        job.mark_submitted();
        table.insert(job);

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            table.add_listener(
                "j1",
                Arc::new(move |_: &str, _: JobState| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        table.apply(&StatusUpdate {
            job_id: "j1".into(),
            state: JobState::Waiting,
            error: None,
            timestamp: None,
        });
        assert_eq!(table.get("j1").unwrap().state(), JobState::Waiting);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
