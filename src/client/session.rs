//! Client session.
//!
//! Registers with the scheduler, keeps a standing status subscription,
//! submits jobs and issues correlated requests.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use meteor_bus::{AckMode, Broker, BusError, Message, QueueOptions};
use meteor_protocol::routing::{self, validate_id};
use meteor_protocol::{Envelope, JobState, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{Result, SessionError};
use super::job::{ClientJob, JobStateListener, StatusUpdate};
use super::status::{self, JobTable};
use super::transfer::{self, Consumer, LinkHandle, ResultFileHandler, TransferHandle};
use crate::config::ClientConfig;

/// A registered client.
///
/// Dropping the session unsubscribes it.
pub struct ClientSession {
    broker: Arc<dyn Broker>,
    client_id: String,
    config: ClientConfig,
    status_exchange: String,
    status_queue: String,
    jobs: Arc<JobTable>,
    updates: Receiver<StatusUpdate>,
    status_thread: Option<JoinHandle<()>>,
    connected: bool,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.client_id)
            .field("status_exchange", &self.status_exchange)
            .field("status_queue", &self.status_queue)
            .field("connected", &self.connected)
            .finish()
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

impl ClientSession {
    /// Register `client_id`; fails if the id is still registered.
    pub fn connect(broker: Arc<dyn Broker>, client_id: &str, config: ClientConfig) -> Result<Self> {
        Self::open(broker, client_id, config, false)
    }

    /// Register `client_id`, taking over any registration still active.
    pub fn reconnect(broker: Arc<dyn Broker>, client_id: &str, config: ClientConfig) -> Result<Self> {
        Self::open(broker, client_id, config, true)
    }

    fn open(broker: Arc<dyn Broker>, client_id: &str, config: ClientConfig, reconnect: bool) -> Result<Self> {
        validate_id(client_id)?;
        let status_queue = broker.declare_queue(QueueOptions::anonymous())?;
        let status_exchange = match handshake(broker.as_ref(), client_id, &status_queue, &config, reconnect) {
            Ok(exchange) => exchange,
            Err(e) => {
                let _ = broker.delete_queue(&status_queue);
                return Err(e);
            }
        };
        if let Err(e) = broker.bind_queue(&status_queue, &status_exchange, routing::status_routing_key(client_id)) {
            let _ = broker.delete_queue(&status_queue);
            return Err(e.into());
        }
        info!(client_id, reconnect, status_exchange = %status_exchange, "client registered");

        let jobs = Arc::new(JobTable::default());
        let (tx, updates) = mpsc::sync_channel(config.status_backlog);
        let status_thread = {
            let broker = broker.clone();
            let queue = status_queue.clone();
            let id = client_id.to_string();
            let table = jobs.clone();
            thread::Builder::new()
                .name(format!("meteor-status-{}", client_id))
                .spawn(move || status::run(broker, queue, id, table, tx))
        };
        let status_thread = match status_thread {
            Ok(t) => t,
            Err(e) => {
                let _ = broker.delete_queue(&status_queue);
                return Err(SessionError::Thread(e));
            }
        };

        Ok(Self {
            broker,
            client_id: client_id.to_string(),
            config,
            status_exchange,
            status_queue,
            jobs,
            updates,
            status_thread: Some(status_thread),
            connected: true,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Exchange named by the scheduler during the handshake.
    pub fn status_exchange(&self) -> &str {
        &self.status_exchange
    }

    pub fn status_queue(&self) -> &str {
        &self.status_queue
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    fn message(&self, body: Vec<u8>, content_type: &str) -> Message {
        Message::new(body)
            .with_content_type(content_type)
            .with_encoding(self.config.encoding.clone())
    }

    /// Publish a job script; the mirror moves INITIALIZE → SUBMIT.
    ///
    /// SUBMIT is set before publishing; every later state comes from a push.
    pub fn submit(&self, job_id: &str, script: &str) -> Result<()> {
        self.ensure_connected()?;
        validate_id(job_id)?;
        let mut job = ClientJob::new(job_id, script);
        job.mark_submitted();
        self.jobs.insert(job);

        let topic = routing::job_topic(&self.client_id, job_id);
        let message = self.message(script.as_bytes().to_vec(), CONTENT_TYPE_TEXT);
        if let Err(e) = self.broker.publish(&self.config.request_exchange, &topic, message) {
            self.jobs.remove(job_id);
            return Err(e.into());
        }
        debug!(client_id = %self.client_id, job_id, "job submitted");
        Ok(())
    }

    /// Copy of the local mirror of a job.
    pub fn job(&self, job_id: &str) -> Option<ClientJob> {
        self.jobs.get(job_id)
    }

    pub fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.jobs.get(job_id).map(|job| job.state())
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.job_ids()
    }

    /// Drop the local mirror and listeners of a job.
    pub fn forget_job(&self, job_id: &str) -> Option<ClientJob> {
        self.jobs.clear_listeners(job_id);
        self.jobs.remove(job_id)
    }

    /// Call `listener` on every pushed state of `job_id`.
    pub fn add_listener(&self, job_id: &str, listener: impl JobStateListener + 'static) {
        self.jobs.add_listener(job_id, Arc::new(listener));
    }

    /// Next status push seen by the subscription, waiting up to `timeout`.
    pub fn next_status(&self, timeout: Duration) -> Option<StatusUpdate> {
        self.updates.recv_timeout(timeout).ok()
    }

    /// Send one request and wait up to `timeout` for its reply.
    ///
    /// Replies with another correlation id are discarded. Returns
    /// `Ok(None)` on timeout.
    pub fn request(&self, envelope: &Envelope, timeout: Duration) -> Result<Option<Envelope>> {
        self.ensure_connected()?;
        let reply_queue = self.broker.declare_queue(QueueOptions::anonymous())?;
        let correlation_id = new_correlation_id();
        let outcome = self
            .publish_request(envelope, &reply_queue, &correlation_id)
            .and_then(|()| self.await_reply(&reply_queue, &correlation_id, timeout));
        if let Err(e) = self.broker.delete_queue(&reply_queue) {
            debug!(queue = %reply_queue, error = %e, "reply queue already gone");
        }
        outcome
    }

    fn publish_request(&self, envelope: &Envelope, reply_queue: &str, correlation_id: &str) -> Result<()> {
        let message = self
            .message(envelope.to_bytes()?, CONTENT_TYPE_JSON)
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_queue);
        self.broker
            .publish(&self.config.request_exchange, routing::REQUEST_KEY, message)?;
        debug!(
            client_id = %self.client_id,
            request = %envelope.request_code,
            correlation_id,
            "request sent"
        );
        Ok(())
    }

    fn await_reply(&self, queue: &str, correlation_id: &str, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(delivery) = self.broker.receive(queue, remaining, AckMode::Auto)? else {
                return Ok(None);
            };
            if delivery.correlation_id() != Some(correlation_id) {
                warn!(
                    expected = %correlation_id,
                    got = ?delivery.correlation_id(),
                    "reply with mismatched correlation id discarded"
                );
                continue;
            }
            match Envelope::parse(&delivery.body) {
                Some(reply) => return Ok(Some(reply)),
                None => warn!(correlation_id, "unparseable reply discarded"),
            }
        }
    }

    fn state_request(&self, envelope: Envelope, timeout: Duration) -> Result<Option<JobState>> {
        match self.request(&envelope, timeout)? {
            Some(reply) if reply.is_error() && reply.job_status.is_none() => Err(SessionError::Remote {
                code: reply.error_code,
                message: reply.error.unwrap_or_default(),
            }),
            Some(reply) => Ok(reply.effective_state()),
            None => Ok(None),
        }
    }

    /// Ask the scheduler for a job's state; DELETED if it holds no record.
    pub fn query_status(&self, job_id: &str, timeout: Duration) -> Result<Option<JobState>> {
        self.state_request(Envelope::job_status(&self.client_id, job_id, None), timeout)
    }

    /// Whether the scheduler holds any record of the job.
    pub fn job_exists(&self, job_id: &str, timeout: Duration) -> Result<Option<bool>> {
        let state = self.state_request(Envelope::job_exists(&self.client_id, job_id), timeout)?;
        Ok(state.map(|s| s != JobState::Undefined))
    }

    /// Ask the scheduler to drop a job. Advisory: a running executor is not interrupted.
    pub fn abort_job(&self, job_id: &str, timeout: Duration) -> Result<Option<JobState>> {
        self.state_request(Envelope::job_abort(&self.client_id, job_id), timeout)
    }

    fn consumer(&self, envelope: &Envelope) -> Result<Consumer> {
        self.ensure_connected()?;
        let queue = self.broker.declare_queue(QueueOptions::anonymous())?;
        let correlation_id = new_correlation_id();
        if let Err(e) = self.publish_request(envelope, &queue, &correlation_id) {
            let _ = self.broker.delete_queue(&queue);
            return Err(e);
        }
        Ok(Consumer {
            broker: self.broker.clone(),
            queue,
            correlation_id,
            idle_timeout: self.config.reply_timeout(),
            encoding: self.config.encoding.clone(),
        })
    }

    /// Look up the stored path of output `file_index`.
    pub fn request_link(&self, job_id: &str, file_index: usize) -> Result<LinkHandle> {
        let consumer = self.consumer(&Envelope::get_link(&self.client_id, job_id, file_index))?;
        Ok(transfer::spawn_link(job_id, consumer)?)
    }

    /// Stream output `file_index` into `handler`.
    ///
    /// The scheduler may grow the block size so no more than
    /// `max_blocks` blocks are sent.
    pub fn request_result(
        &self,
        job_id: &str,
        file_index: usize,
        desired_block_size: u64,
        max_blocks: u64,
        handler: impl ResultFileHandler + 'static,
    ) -> Result<TransferHandle> {
        let envelope =
            Envelope::request_result(&self.client_id, job_id, file_index, desired_block_size, max_blocks);
        let consumer = self.consumer(&envelope)?;
        debug!(
            client_id = %self.client_id,
            job_id,
            file_index,
            correlation_id = %consumer.correlation_id,
            "result requested"
        );
        Ok(transfer::spawn_result(job_id, file_index, consumer, Box::new(handler))?)
    }

    /// Log off and release the status queue. No-op once done.
    pub fn unsubscribe(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        let logoff = self
            .message(self.client_id.as_bytes().to_vec(), CONTENT_TYPE_TEXT)
            .with_header(routing::STATUS_QUEUE_HEADER, self.status_queue.clone());
        let published = self
            .broker
            .publish(&self.config.request_exchange, routing::REGISTER_LOGOFF, logoff);

        match self.broker.delete_queue(&self.status_queue) {
            Ok(()) | Err(BusError::QueueNotFound(_)) | Err(BusError::Closed) => {}
            Err(e) => warn!(queue = %self.status_queue, error = %e, "could not delete status queue"),
        }
        if let Some(thread) = self.status_thread.take() {
            let _ = thread.join();
        }
        info!(client_id = %self.client_id, "client unsubscribed");
        published.map_err(SessionError::from)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Err(e) = self.unsubscribe() {
            warn!(client_id = %self.client_id, error = %e, "unsubscribe on drop failed");
        }
    }
}

/// Publish the login and wait for the scheduler's answer.
///
/// Returns the status exchange name.
fn handshake(
    broker: &dyn Broker,
    client_id: &str,
    status_queue: &str,
    config: &ClientConfig,
    reconnect: bool,
) -> Result<String> {
    let reply_queue = broker.declare_queue(QueueOptions::anonymous())?;
    let result = login(broker, client_id, status_queue, config, reconnect, &reply_queue);
    let _ = broker.delete_queue(&reply_queue);
    result
}

fn login(
    broker: &dyn Broker,
    client_id: &str,
    status_queue: &str,
    config: &ClientConfig,
    reconnect: bool,
    reply_queue: &str,
) -> Result<String> {
    let mut login = Message::new(client_id.as_bytes().to_vec())
        .with_content_type(CONTENT_TYPE_TEXT)
        .with_encoding(config.encoding.clone())
        .with_reply_to(reply_queue)
        .with_header(routing::STATUS_QUEUE_HEADER, status_queue);
    if reconnect {
        login = login.with_priority(routing::RECONNECT_PRIORITY);
    }
    broker.publish(&config.request_exchange, routing::REGISTER_LOGIN, login)?;

    let Some(reply) = broker.receive(reply_queue, config.handshake_timeout(), AckMode::Auto)? else {
        return Err(SessionError::HandshakeTimeout(config.handshake_timeout()));
    };
    let answer = reply.body_text().trim().to_string();
    if answer == routing::STILL_REGISTERED {
        warn!(client_id, "registration rejected");
        return Err(SessionError::DuplicateRegistration(client_id.to_string()));
    }
    if answer.is_empty() {
        return Err(SessionError::Remote {
            code: None,
            message: "empty registration reply".to_string(),
        });
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_bus::MemoryBroker;

    fn config() -> ClientConfig {
        ClientConfig {
            handshake_timeout_ms: 100,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_handshake_times_out_without_scheduler() {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange(routing::REQUEST_EXCHANGE, meteor_bus::ExchangeKind::Topic, true)
            .unwrap();
        let err = ClientSession::connect(Arc::new(broker.clone()), "alice", config()).unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
    }

    #[test]
    fn test_rejects_invalid_client_id() {
        let broker = MemoryBroker::new();
        let err = ClientSession::connect(Arc::new(broker), "a.b", config()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidId(_)));
    }

    #[test]
    fn test_missing_exchange_is_a_bus_error() {
        let broker = MemoryBroker::new();
        let err = ClientSession::connect(Arc::new(broker), "alice", config()).unwrap_err();
        assert!(matches!(err, SessionError::Bus(BusError::ExchangeNotFound(_))));
    }
}
