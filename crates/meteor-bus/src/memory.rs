//! In-process broker.
//!
//! Holds all exchanges and queues behind one mutex; receivers park on a
//! shared condition variable that is signalled on every publish, requeue,
//! delete and close.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::BusError;
use crate::message::{Delivery, Message, Properties};
use crate::topic::topic_matches;
use crate::{AckMode, Broker, ExchangeKind, QueueOptions, DEFAULT_EXCHANGE};

/// Broker that lives entirely in this process.
///
/// Cloning yields another handle onto the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    ready: Condvar,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    next_tag: u64,
    closed: bool,
}

struct Exchange {
    kind: ExchangeKind,
    /// (binding key, queue name)
    bindings: Vec<(String, String)>,
}

struct Queue {
    options: QueueOptions,
    messages: VecDeque<Stored>,
    unacked: BTreeMap<u64, Stored>,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Vec<u8>,
    redelivered: bool,
}

impl Queue {
    fn push(&mut self, message: Stored) {
        let priority = message.properties.priority;
        let at = self
            .messages
            .iter()
            .position(|m| m.properties.priority < priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(at, message);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of ready messages in a queue, or `None` if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    /// All (exchange, binding key) pairs routing into a queue.
    pub fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        let state = self.lock();
        let mut out: Vec<(String, String)> = state
            .exchanges
            .iter()
            .flat_map(|(name, ex)| {
                ex.bindings
                    .iter()
                    .filter(|(_, q)| q == queue)
                    .map(move |(key, _)| (name.clone(), key.clone()))
            })
            .collect();
        out.sort();
        out
    }

    /// Shut the broker down; every pending and future receive fails.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.ready.notify_all();
    }

    fn check_open(state: &BrokerState) -> Result<(), BusError> {
        if state.closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Broker for MemoryBroker {
    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), BusError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BusError::ExchangeMismatch {
                    name: name.to_string(),
                    existing: existing.kind,
                    requested: kind,
                });
            }
            return Ok(());
        }
        debug!(exchange = name, ?kind, durable, "declared exchange");
        state.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    fn declare_queue(&self, options: QueueOptions) -> Result<String, BusError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("amq.gen-{}", uuid::Uuid::new_v4().simple()));

        if let Some(existing) = state.queues.get(&name) {
            if existing.options.exclusive || options.exclusive {
                return Err(BusError::QueueLocked(name));
            }
            return Ok(name);
        }

        debug!(queue = %name, durable = options.durable, exclusive = options.exclusive, "declared queue");
        state.queues.insert(
            name.clone(),
            Queue {
                options,
                messages: VecDeque::new(),
                unacked: BTreeMap::new(),
            },
        );
        Ok(name)
    }

    fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), BusError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BusError::DefaultExchangeBinding);
        }
        let mut state = self.lock();
        Self::check_open(&state)?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (binding_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
            debug!(queue, exchange, binding_key, "bound queue");
        }
        Ok(())
    }

    fn unbind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
        ex.bindings.retain(|(key, q)| !(key == binding_key && q == queue));
        Ok(())
    }

    fn delete_queue(&self, queue: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.queues.remove(queue).is_none() {
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        for ex in state.exchanges.values_mut() {
            ex.bindings.retain(|(_, q)| q != queue);
        }
        drop(state);
        debug!(queue, "deleted queue");
        self.inner.ready.notify_all();
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<(), BusError> {
        let mut state = self.lock();
        Self::check_open(&state)?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let ex = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
            let mut targets: Vec<String> = Vec::new();
            for (key, queue) in &ex.bindings {
                let hit = match ex.kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Topic => topic_matches(key, routing_key),
                };
                if hit && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        let stored = Stored {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: message.properties,
            body: message.body,
            redelivered: false,
        };

        let mut routed = 0;
        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.push(stored.clone());
                routed += 1;
            }
        }
        drop(state);

        if routed == 0 {
            trace!(exchange, routing_key, "unroutable message dropped");
        } else {
            self.inner.ready.notify_all();
        }
        Ok(())
    }

    fn receive(
        &self,
        queue: &str,
        timeout: Duration,
        ack: AckMode,
    ) -> Result<Option<Delivery>, BusError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            Self::check_open(&state)?;
            let tag = state.next_tag + 1;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;

            if let Some(stored) = q.messages.pop_front() {
                if ack == AckMode::Manual {
                    q.unacked.insert(tag, stored.clone());
                }
                state.next_tag = tag;
                return Ok(Some(Delivery {
                    exchange: stored.exchange,
                    routing_key: stored.routing_key,
                    delivery_tag: tag,
                    redelivered: stored.redelivered,
                    properties: stored.properties,
                    body: stored.body,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .inner
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BusError> {
        let mut state = self.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
        q.unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BusError::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag: delivery_tag,
            })
    }

    fn recover(&self, queue: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
        let pending = std::mem::take(&mut q.unacked);
        for (_, mut stored) in pending.into_iter().rev() {
            stored.redelivered = true;
            q.messages.push_front(stored);
        }
        drop(state);
        self.inner.ready.notify_all();
        Ok(())
    }
}
