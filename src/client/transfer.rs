//! Result and link consumers.
//!
//! Each result or link request gets its own reply queue and a consumer
//! thread keyed by the request's correlation id, so it can run alongside
//! ad-hoc requests and other transfers. A result consumer reads the
//! scheduler's block plan first, then hands every binary block to the
//! caller's handler until the announced count has arrived.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use meteor_bus::{AckMode, Broker, BusError, Delivery};
use meteor_protocol::{Envelope, ErrorCode, RequestCode, ResultFileBlock, CONTENT_TYPE_JSON};
use tracing::{debug, trace, warn};

use super::error::SessionError;

const POLL: Duration = Duration::from_millis(50);

/// Receiver of result blocks, in block order.
pub trait ResultFileHandler: Send {
    fn on_block(&mut self, job_id: &str, block: ResultFileBlock);
}

impl<F> ResultFileHandler for F
where
    F: FnMut(&str, ResultFileBlock) + Send,
{
    fn on_block(&mut self, job_id: &str, block: ResultFileBlock) {
        self(job_id, block)
    }
}

/// Handler that appends every block to a shared buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingHandler {
    inner: Arc<Mutex<Collected>>,
}

#[derive(Debug, Default)]
struct Collected {
    bytes: Vec<u8>,
    blocks: u64,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).bytes.clone()
    }

    pub fn blocks(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).blocks
    }
}

impl ResultFileHandler for CollectingHandler {
    fn on_block(&mut self, _job_id: &str, block: ResultFileBlock) {
        let mut collected = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        collected.bytes.extend_from_slice(&block.bytes);
        collected.blocks += 1;
    }
}

/// How a result transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every announced block was delivered.
    Completed { block_size: u64, total_blocks: u64 },
    /// The scheduler answered with an ERROR envelope, before or during the stream.
    Rejected {
        code: Option<ErrorCode>,
        message: String,
        blocks_received: u64,
    },
    /// Nothing arrived for longer than the reply timeout.
    TimedOut {
        blocks_received: u64,
        total_blocks: Option<u64>,
    },
    /// The reply queue went away underneath the consumer.
    Interrupted { blocks_received: u64 },
}

impl TransferOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. })
    }
}

/// Pending outcome of a background consumer.
pub struct Pending<T> {
    rx: Receiver<T>,
    thread: Option<JoinHandle<()>>,
}

impl<T> Pending<T> {
    /// Wait up to `timeout` for the outcome; `None` if it is not ready.
    pub fn wait(&mut self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Handle to a running result transfer.
pub type TransferHandle = Pending<TransferOutcome>;

/// Handle to a pending link lookup; yields the output path or the scheduler's refusal.
pub type LinkHandle = Pending<Result<String, SessionError>>;

/// What a consumer thread needs to own its reply queue.
pub(crate) struct Consumer {
    pub broker: Arc<dyn Broker>,
    pub queue: String,
    pub correlation_id: String,
    pub idle_timeout: Duration,
    pub encoding: String,
}

impl Consumer {
    /// Next delivery carrying our correlation id; others are dropped.
    fn next(&self, idle_since: &mut Instant) -> Result<Option<Delivery>, BusError> {
        loop {
            if idle_since.elapsed() >= self.idle_timeout {
                return Ok(None);
            }
            let Some(delivery) = self.broker.receive(&self.queue, POLL, AckMode::Auto)? else {
                continue;
            };
            *idle_since = Instant::now();
            if delivery.correlation_id() == Some(self.correlation_id.as_str()) {
                return Ok(Some(delivery));
            }
            debug!(
                queue = %self.queue,
                correlation_id = ?delivery.correlation_id(),
                expected = %self.correlation_id,
                "dropped reply with foreign correlation id"
            );
        }
    }

    fn close(&self) {
        match self.broker.delete_queue(&self.queue) {
            Ok(()) | Err(BusError::QueueNotFound(_)) | Err(BusError::Closed) => {}
            Err(e) => warn!(queue = %self.queue, error = %e, "could not delete reply queue"),
        }
    }
}

fn spawn_consumer<T, F>(name: String, consumer: Consumer, body: F) -> std::io::Result<Pending<T>>
where
    T: Send + 'static,
    F: FnOnce(&Consumer) -> T + Send + 'static,
{
    let (tx, rx): (Sender<T>, Receiver<T>) = mpsc::channel();
    let thread = thread::Builder::new().name(name).spawn(move || {
        let outcome = body(&consumer);
        consumer.close();
        let _ = tx.send(outcome);
    })?;
    Ok(Pending {
        rx,
        thread: Some(thread),
    })
}

fn rejection(envelope: &Envelope) -> (Option<ErrorCode>, String) {
    (
        envelope.error_code,
        envelope.error.clone().unwrap_or_else(|| "request refused".to_string()),
    )
}

/// Start consuming a GET_LINK reply.
pub(crate) fn spawn_link(job_id: &str, consumer: Consumer) -> std::io::Result<LinkHandle> {
    let job_id = job_id.to_string();
    spawn_consumer(format!("meteor-link-{}", job_id), consumer, move |c| {
        let mut idle_since = Instant::now();
        loop {
            let delivery = match c.next(&mut idle_since) {
                Ok(Some(d)) => d,
                Ok(None) => {
                    return Err(SessionError::Remote {
                        code: None,
                        message: format!("no link reply for job {}", job_id),
                    })
                }
                Err(e) => return Err(SessionError::Bus(e)),
            };
            let Some(envelope) = Envelope::parse(&delivery.body) else {
                warn!(job_id = %job_id, "unparseable link reply dropped");
                continue;
            };
            if envelope.is_error() {
                let (code, message) = rejection(&envelope);
                return Err(SessionError::Remote { code, message });
            }
            match envelope.path {
                Some(path) => return Ok(path),
                None => warn!(job_id = %job_id, "link reply without path dropped"),
            }
        }
    })
}

/// Start consuming a result transfer.
pub(crate) fn spawn_result(
    job_id: &str,
    file_index: usize,
    consumer: Consumer,
    mut handler: Box<dyn ResultFileHandler>,
) -> std::io::Result<TransferHandle> {
    let job_id = job_id.to_string();
    let name = format!("meteor-result-{}-{}", job_id, file_index);
    spawn_consumer(name, consumer, move |c| {
        let mut idle_since = Instant::now();
        let mut plan: Option<(u64, u64)> = None;
        let mut received = 0u64;

        loop {
            let delivery = match c.next(&mut idle_since) {
                Ok(Some(d)) => d,
                Ok(None) => {
                    warn!(job_id = %job_id, file_index, received, "result transfer timed out");
                    return TransferOutcome::TimedOut {
                        blocks_received: received,
                        total_blocks: plan.map(|(_, total)| total),
                    };
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "result transfer interrupted");
                    return TransferOutcome::Interrupted {
                        blocks_received: received,
                    };
                }
            };

            let structured = delivery.properties.content_type.as_deref() == Some(CONTENT_TYPE_JSON);
            let Some((block_size, total)) = plan else {
                // first reply is the block plan or a refusal
                let Some(envelope) = Envelope::parse(&delivery.body) else {
                    warn!(job_id = %job_id, "unparseable transfer header dropped");
                    continue;
                };
                if envelope.is_error() {
                    let (code, message) = rejection(&envelope);
                    return TransferOutcome::Rejected {
                        code,
                        message,
                        blocks_received: 0,
                    };
                }
                match (envelope.request_code, envelope.desired_block_size, envelope.maximum_number_of_blocks) {
                    (RequestCode::RequestResult, Some(size), Some(total)) if size >= 0 && total >= 0 => {
                        debug!(job_id = %job_id, file_index, block_size = size, total_blocks = total, "transfer announced");
                        if total == 0 {
                            return TransferOutcome::Completed {
                                block_size: size as u64,
                                total_blocks: 0,
                            };
                        }
                        plan = Some((size as u64, total as u64));
                    }
                    _ => warn!(job_id = %job_id, request = %envelope.request_code, "unexpected transfer header dropped"),
                }
                continue;
            };

            if structured {
                if let Some(envelope) = Envelope::parse(&delivery.body).filter(Envelope::is_error) {
                    let (code, message) = rejection(&envelope);
                    return TransferOutcome::Rejected {
                        code,
                        message,
                        blocks_received: received,
                    };
                }
            }

            let block = ResultFileBlock {
                encoding: delivery
                    .properties
                    .content_encoding
                    .clone()
                    .unwrap_or_else(|| c.encoding.clone()),
                bytes: delivery.body,
                block_index: received,
                block_size,
                total_blocks: total,
            };
            trace!(job_id = %job_id, block = received, bytes = block.bytes.len(), "block received");
            handler.on_block(&job_id, block);
            received += 1;
            if received == total {
                return TransferOutcome::Completed {
                    block_size,
                    total_blocks: total,
                };
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_bus::{MemoryBroker, Message, QueueOptions, DEFAULT_EXCHANGE};
    use meteor_protocol::CONTENT_TYPE_BINARY;

    fn consumer(broker: &MemoryBroker) -> Consumer {
        Consumer {
            broker: Arc::new(broker.clone()),
            queue: broker.declare_queue(QueueOptions::anonymous()).unwrap(),
            correlation_id: "corr".into(),
            idle_timeout: Duration::from_millis(500),
            encoding: "UTF-8".into(),
        }
    }

    fn json(broker: &MemoryBroker, queue: &str, corr: &str, envelope: &Envelope) {
        let msg = Message::new(envelope.to_bytes().unwrap())
            .with_content_type(CONTENT_TYPE_JSON)
            .with_correlation_id(corr);
        broker.publish(DEFAULT_EXCHANGE, queue, msg).unwrap();
    }

    fn block(broker: &MemoryBroker, queue: &str, corr: &str, bytes: &[u8]) {
        let msg = Message::new(bytes.to_vec())
            .with_content_type(CONTENT_TYPE_BINARY)
            .with_correlation_id(corr);
        broker.publish(DEFAULT_EXCHANGE, queue, msg).unwrap();
    }

    fn plan(block_size: i64, total: i64) -> Envelope {
        let mut e = Envelope::new(RequestCode::RequestResult);
        e.desired_block_size = Some(block_size);
        e.maximum_number_of_blocks = Some(total);
        e
    }

    #[test]
    fn test_blocks_reassemble_and_foreign_replies_are_dropped() {
        let broker = MemoryBroker::new();
        let c = consumer(&broker);
        let queue = c.queue.clone();
        json(&broker, &queue, "corr", &plan(3, 2));
        block(&broker, &queue, "other", b"zzz");
        block(&broker, &queue, "corr", b"abc");
        block(&broker, &queue, "corr", b"defg");

        let collected = CollectingHandler::new();
        let mut handle = spawn_result("j1", 0, c, Box::new(collected.clone())).unwrap();
        let outcome = handle.wait(Duration::from_secs(5)).unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                block_size: 3,
                total_blocks: 2
            }
        );
        assert_eq!(collected.bytes(), b"abcdefg");
        assert_eq!(collected.blocks(), 2);
        assert!(!broker.has_queue(&queue));
    }

    #[test]
    fn test_error_header_rejects_transfer() {
        let broker = MemoryBroker::new();
        let c = consumer(&broker);
        let err = Envelope::error_reply(Some("c"), Some("j1"), ErrorCode::JobNotFinished, "job j1 is RUNNING");
        json(&broker, &c.queue.clone(), "corr", &err);

        let mut handle = spawn_result("j1", 0, c, Box::new(CollectingHandler::new())).unwrap();
        match handle.wait(Duration::from_secs(5)).unwrap() {
            TransferOutcome::Rejected { code, blocks_received, .. } => {
                assert_eq!(code, Some(ErrorCode::JobNotFinished));
                assert_eq!(blocks_received, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_closure_handler_sees_block_positions() {
        let broker = MemoryBroker::new();
        let c = consumer(&broker);
        let queue = c.queue.clone();
        json(&broker, &queue, "corr", &plan(2, 3));
        for chunk in [&b"ab"[..], b"cd", b"e"] {
            block(&broker, &queue, "corr", chunk);
        }

        let (tx, rx) = mpsc::channel();
        let handler = move |_: &str, b: ResultFileBlock| {
            let _ = tx.send((b.block_index, b.is_last()));
        };
        let mut handle = spawn_result("j1", 0, c, Box::new(handler)).unwrap();
        assert!(handle.wait(Duration::from_secs(5)).unwrap().is_complete());
        let seen: Vec<(u64, bool)> = rx.try_iter().collect();
        assert_eq!(seen, vec![(0, false), (1, false), (2, true)]);
    }

    #[test]
    fn test_silence_times_out() {
        let broker = MemoryBroker::new();
        let mut c = consumer(&broker);
        c.idle_timeout = Duration::from_millis(100);
        let mut handle = spawn_result("j1", 0, c, Box::new(CollectingHandler::new())).unwrap();
        assert_eq!(
            handle.wait(Duration::from_secs(5)),
            Some(TransferOutcome::TimedOut {
                blocks_received: 0,
                total_blocks: None
            })
        );
    }

    #[test]
    fn test_link_reply() {
        let broker = MemoryBroker::new();
        let c = consumer(&broker);
        let reply = Envelope::get_link("c", "j1", 0).with_path("file:///r/c/out.json");
        json(&broker, &c.queue.clone(), "corr", &reply);

        let mut handle = spawn_link("j1", c).unwrap();
        let path = handle.wait(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(path, "file:///r/c/out.json");
    }
}
