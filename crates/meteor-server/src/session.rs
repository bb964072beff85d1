//! Server side of the bus session.
//!
//! Declares the request and status exchanges, consumes the request queue,
//! classifies each delivery by routing key and offers the outbound
//! primitives: status push, correlated reply and raw block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meteor_bus::{AckMode, Broker, BusError, Delivery, ExchangeKind, Message, QueueOptions, DEFAULT_EXCHANGE};
use meteor_protocol::routing::{self, Topic};
use meteor_protocol::{Envelope, CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT, DEFAULT_ENCODING};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::Result;

/// Header carrying the zero-based index of a result block.
pub const BLOCK_INDEX_HEADER: &str = "x-block-index";

/// Header carrying the announced block count of a transfer.
pub const BLOCK_TOTAL_HEADER: &str = "x-block-total";

/// Where and how to answer one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub reply_to: String,
    pub correlation_id: Option<String>,
    pub encoding: String,
}

impl ReplyTarget {
    /// Reply address of a delivery, if it named one.
    pub fn from_delivery(delivery: &Delivery) -> Option<Self> {
        let reply_to = delivery.reply_to()?.to_string();
        Some(Self {
            reply_to,
            correlation_id: delivery.properties.correlation_id.clone(),
            encoding: delivery
                .properties
                .content_encoding
                .clone()
                .unwrap_or_else(|| DEFAULT_ENCODING.to_string()),
        })
    }
}

/// Sends replies to one requester.
#[derive(Clone)]
pub struct Replier {
    broker: Arc<dyn Broker>,
    target: ReplyTarget,
}

impl Replier {
    pub fn new(broker: Arc<dyn Broker>, target: ReplyTarget) -> Self {
        Self { broker, target }
    }

    pub fn target(&self) -> &ReplyTarget {
        &self.target
    }

    fn message(&self, body: Vec<u8>, content_type: &str) -> Message {
        let mut message = Message::new(body)
            .with_content_type(content_type)
            .with_encoding(self.target.encoding.clone());
        if let Some(id) = &self.target.correlation_id {
            message = message.with_correlation_id(id.clone());
        }
        message
    }

    /// Structured reply carrying the request's correlation id.
    pub fn reply(&self, envelope: &Envelope) -> Result<()> {
        let message = self.message(envelope.to_bytes()?, CONTENT_TYPE_JSON);
        self.broker
            .publish(DEFAULT_EXCHANGE, &self.target.reply_to, message)?;
        Ok(())
    }

    /// Plain-text reply, used by the registration handshake.
    pub fn reply_text(&self, text: &str) -> Result<()> {
        let message = self.message(text.as_bytes().to_vec(), CONTENT_TYPE_TEXT);
        self.broker
            .publish(DEFAULT_EXCHANGE, &self.target.reply_to, message)?;
        Ok(())
    }

    /// One raw block of a result transfer.
    pub fn send_block(&self, bytes: Vec<u8>, index: u64, total: u64) -> Result<()> {
        let message = self
            .message(bytes, CONTENT_TYPE_BINARY)
            .with_header(BLOCK_INDEX_HEADER, index.to_string())
            .with_header(BLOCK_TOTAL_HEADER, total.to_string());
        self.broker
            .publish(DEFAULT_EXCHANGE, &self.target.reply_to, message)?;
        Ok(())
    }
}

/// A classified inbound delivery.
pub enum Inbound {
    Login {
        client_id: String,
        reconnect: bool,
        /// Status queue the client will bind once registered.
        status_queue: Option<String>,
        reply: Replier,
    },
    Logoff {
        client_id: String,
        status_queue: Option<String>,
    },
    JobSubmission {
        client_id: String,
        job_id: String,
        script: String,
    },
    Request {
        envelope: Envelope,
        reply: Option<Replier>,
    },
    /// Anything that cannot be acted on; logged and dropped.
    Malformed {
        routing_key: String,
        reason: String,
    },
}

pub struct ServerSession {
    broker: Arc<dyn Broker>,
    request_exchange: String,
    status_exchange: String,
    request_queue: String,
    /// Active client ids and the status queue of the owning session.
    registrations: HashMap<String, Option<String>>,
}

impl ServerSession {
    /// Declare exchanges and the request queue, and bind the three topic patterns.
    pub fn open(broker: Arc<dyn Broker>, config: &ServerConfig) -> Result<Self> {
        broker.declare_exchange(&config.request_exchange, ExchangeKind::Topic, true)?;
        broker.declare_exchange(&config.status_exchange, ExchangeKind::Direct, false)?;
        let request_queue = broker.declare_queue(QueueOptions::durable(config.request_queue.clone()))?;
        for pattern in [routing::JOB_KEY_MASK, routing::REQUEST_KEY, routing::REGISTER_KEY_MASK] {
            broker.bind_queue(&request_queue, &config.request_exchange, pattern)?;
        }
        info!(
            request_exchange = %config.request_exchange,
            status_exchange = %config.status_exchange,
            queue = %request_queue,
            "server session open"
        );
        Ok(Self {
            broker,
            request_exchange: config.request_exchange.clone(),
            status_exchange: config.status_exchange.clone(),
            request_queue,
            registrations: HashMap::new(),
        })
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn request_exchange(&self) -> &str {
        &self.request_exchange
    }

    pub fn status_exchange(&self) -> &str {
        &self.status_exchange
    }

    /// Wait up to `timeout` for the next inbound delivery.
    pub fn receive(&self, timeout: Duration) -> std::result::Result<Option<Inbound>, BusError> {
        let delivery = self.broker.receive(&self.request_queue, timeout, AckMode::Auto)?;
        Ok(delivery.map(|d| self.classify(d)))
    }

    pub fn classify(&self, delivery: Delivery) -> Inbound {
        let routing_key = delivery.routing_key.clone();
        let malformed = |reason: &str| Inbound::Malformed {
            routing_key: routing_key.clone(),
            reason: reason.to_string(),
        };
        let status_queue = delivery.header(routing::STATUS_QUEUE_HEADER).map(str::to_string);

        match Topic::parse(&delivery.routing_key) {
            Topic::Login => {
                let client_id = delivery.body_text().trim().to_string();
                if client_id.is_empty() {
                    return malformed("login without client id");
                }
                let Some(target) = ReplyTarget::from_delivery(&delivery) else {
                    return malformed("login without reply address");
                };
                Inbound::Login {
                    client_id,
                    reconnect: delivery.properties.priority == routing::RECONNECT_PRIORITY,
                    status_queue,
                    reply: Replier::new(self.broker.clone(), target),
                }
            }
            Topic::Logoff => {
                let client_id = delivery.body_text().trim().to_string();
                if client_id.is_empty() {
                    return malformed("logoff without client id");
                }
                Inbound::Logoff { client_id, status_queue }
            }
            Topic::JobSubmission { client_id, job_id } => Inbound::JobSubmission {
                client_id,
                job_id,
                script: delivery.body_text(),
            },
            Topic::Request => {
                if let Some(content_type) = delivery.properties.content_type.as_deref() {
                    if content_type != CONTENT_TYPE_JSON {
                        return malformed("request is not JSON");
                    }
                }
                match Envelope::parse(&delivery.body) {
                    Some(envelope) => Inbound::Request {
                        envelope,
                        reply: ReplyTarget::from_delivery(&delivery)
                            .map(|target| Replier::new(self.broker.clone(), target)),
                    },
                    None => malformed("unparseable envelope"),
                }
            }
            Topic::Unknown(_) => malformed("unknown topic"),
        }
    }

    /// Add a registration owned by the session behind `status_queue`.
    ///
    /// Returns false if the id is already active and this is not a
    /// reconnect. A reconnect always succeeds and unbinds the status
    /// queue of the session it supersedes.
    pub fn register(&mut self, client_id: &str, status_queue: Option<&str>, reconnect: bool) -> bool {
        let owner = status_queue.map(str::to_string);
        match self.registrations.get(client_id).cloned() {
            Some(_) if !reconnect => return false,
            Some(Some(previous)) if owner.as_deref() != Some(previous.as_str()) => {
                self.release_binding(client_id, &previous);
            }
            _ => {}
        }
        self.registrations.insert(client_id.to_string(), owner);
        true
    }

    fn release_binding(&self, client_id: &str, queue: &str) {
        let key = routing::status_routing_key(client_id);
        match self.broker.unbind_queue(queue, &self.status_exchange, key) {
            Ok(()) => info!(client_id, queue, "superseded status binding released"),
            Err(e) => debug!(client_id, queue, error = %e, "superseded status binding already gone"),
        }
    }

    /// Remove a registration if `status_queue` still owns it.
    ///
    /// A logoff from a superseded session leaves the current owner alone.
    pub fn unregister(&mut self, client_id: &str, status_queue: Option<&str>) -> bool {
        let owned = self
            .registrations
            .get(client_id)
            .map_or(false, |owner| owner.as_deref() == status_queue);
        if owned {
            self.registrations.remove(client_id);
        }
        owned
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.registrations.contains_key(client_id)
    }

    pub fn registered_clients(&self) -> Vec<&str> {
        let mut clients: Vec<&str> = self.registrations.keys().map(String::as_str).collect();
        clients.sort_unstable();
        clients
    }

    /// Push a status envelope to one client's status binding.
    pub fn send_job_status(&self, client_id: &str, status: &Envelope) -> Result<()> {
        let message = Message::new(status.to_bytes()?)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_encoding(DEFAULT_ENCODING)
            .with_timestamp(Utc::now());
        self.broker.publish(
            &self.status_exchange,
            routing::status_routing_key(client_id),
            message,
        )?;
        debug!(client_id, state = ?status.effective_state(), "status pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_bus::MemoryBroker;
    use meteor_protocol::{JobState, RequestCode};

    fn open() -> (MemoryBroker, ServerSession) {
        let broker = MemoryBroker::new();
        let session = ServerSession::open(Arc::new(broker.clone()), &ServerConfig::default()).unwrap();
        (broker, session)
    }

    fn deliver(session: &ServerSession) -> Inbound {
        session.receive(Duration::from_millis(50)).unwrap().unwrap()
    }

    #[test]
    fn test_open_binds_request_patterns() {
        let (broker, _session) = open();
        let bindings = broker.bindings_of(routing::REQUEST_QUEUE);
        let keys: Vec<&str> = bindings.iter().map(|(_, k)| k.as_str()).collect();
        assert_eq!(keys, vec!["register.*", "request", "setJob.*.#"]);
    }

    #[test]
    fn test_classifies_submission_by_topic() {
        let (broker, session) = open();
        broker
            .publish(routing::REQUEST_EXCHANGE, &routing::job_topic("alice", "j1"), Message::new("read x"))
            .unwrap();
        match deliver(&session) {
            Inbound::JobSubmission { client_id, job_id, script } => {
                assert_eq!((client_id.as_str(), job_id.as_str(), script.as_str()), ("alice", "j1", "read x"));
            }
            _ => panic!("expected job submission"),
        }
    }

    #[test]
    fn test_login_priority_marks_reconnect() {
        let (broker, session) = open();
        let msg = Message::new("alice")
            .with_reply_to("hs")
            .with_priority(routing::RECONNECT_PRIORITY)
            .with_header(routing::STATUS_QUEUE_HEADER, "status-q");
        broker.publish(routing::REQUEST_EXCHANGE, routing::REGISTER_LOGIN, msg).unwrap();
        match deliver(&session) {
            Inbound::Login {
                client_id,
                reconnect,
                status_queue,
                reply,
            } => {
                assert_eq!(client_id, "alice");
                assert!(reconnect);
                assert_eq!(status_queue.as_deref(), Some("status-q"));
                assert_eq!(reply.target().reply_to, "hs");
            }
            _ => panic!("expected login"),
        }
    }

    #[test]
    fn test_garbage_request_is_malformed() {
        let (broker, session) = open();
        broker
            .publish(routing::REQUEST_EXCHANGE, routing::REQUEST_KEY, Message::new("{nope"))
            .unwrap();
        assert!(matches!(deliver(&session), Inbound::Malformed { .. }));

        let env = Envelope::job_exists("c", "j").to_bytes().unwrap();
        broker
            .publish(
                routing::REQUEST_EXCHANGE,
                routing::REQUEST_KEY,
                Message::new(env).with_content_type(CONTENT_TYPE_BINARY),
            )
            .unwrap();
        assert!(matches!(deliver(&session), Inbound::Malformed { .. }));
    }

    #[test]
    fn test_register_rules() {
        let (_broker, mut session) = open();
        assert!(session.register("alice", Some("q1"), false));
        assert!(!session.register("alice", Some("q2"), false));
        assert!(session.register("alice", Some("q2"), true));
        assert!(session.unregister("alice", Some("q2")));
        assert!(!session.is_registered("alice"));
        assert!(session.register("alice", Some("q3"), false));
    }

    #[test]
    fn test_takeover_releases_previous_binding_and_ignores_its_logoff() {
        let (broker, mut session) = open();
        let old = broker.declare_queue(QueueOptions::anonymous()).unwrap();
        assert!(session.register("alice", Some(&old), false));
        broker.bind_queue(&old, routing::STATUS_EXCHANGE, "alice").unwrap();

        let new = broker.declare_queue(QueueOptions::anonymous()).unwrap();
        assert!(session.register("alice", Some(&new), true));
        assert!(broker.bindings_of(&old).is_empty());

        assert!(!session.unregister("alice", Some(&old)));
        assert!(session.is_registered("alice"));
        assert!(!session.register("alice", Some("q9"), false));
        assert!(session.unregister("alice", Some(&new)));
    }

    #[test]
    fn test_status_push_reaches_bound_queue() {
        let (broker, session) = open();
        let q = broker.declare_queue(QueueOptions::anonymous()).unwrap();
        broker.bind_queue(&q, routing::STATUS_EXCHANGE, "alice").unwrap();

        session
            .send_job_status("alice", &Envelope::job_status("alice", "j1", Some(JobState::Waiting)))
            .unwrap();
        session
            .send_job_status("bob", &Envelope::job_status("bob", "j1", Some(JobState::Waiting)))
            .unwrap();

        let d = broker.receive(&q, Duration::ZERO, AckMode::Auto).unwrap().unwrap();
        let env = Envelope::parse(&d.body).unwrap();
        assert_eq!(env.request_code, RequestCode::JobStatus);
        assert!(d.properties.timestamp.is_some());
        assert_eq!(broker.queue_len(&q), Some(0));
    }

    #[test]
    fn test_reply_carries_correlation_id() {
        let (broker, _session) = open();
        let q = broker.declare_queue(QueueOptions::anonymous()).unwrap();
        let replier = Replier::new(
            Arc::new(broker.clone()),
            ReplyTarget {
                reply_to: q.clone(),
                correlation_id: Some("corr-1".into()),
                encoding: DEFAULT_ENCODING.into(),
            },
        );
        replier.send_block(b"abc".to_vec(), 0, 1).unwrap();
        let d = broker.receive(&q, Duration::ZERO, AckMode::Auto).unwrap().unwrap();
        assert_eq!(d.correlation_id(), Some("corr-1"));
        assert_eq!(d.header(BLOCK_INDEX_HEADER), Some("0"));
        assert_eq!(d.properties.content_type.as_deref(), Some(CONTENT_TYPE_BINARY));
    }
}
