//! Message Bus
//!
//! Abstracts the publish/subscribe broker the scheduler and its clients
//! talk through. Provides:
//! - Broker trait: exchanges, queues, bindings, publish and pull-style receive
//! - MemoryBroker: in-process broker used by tests and single-process setups
//!
//! Exchanges are either `Topic` (binding keys may use `*` for one word and
//! `#` for zero or more words) or `Direct` (exact key match). The unnamed
//! default exchange `""` routes straight to the queue named by the key.

pub mod error;
pub mod memory;
pub mod message;
pub mod topic;

use std::time::Duration;

pub use error::BusError;
pub use memory::MemoryBroker;
pub use message::{Delivery, Message, Properties};
pub use topic::topic_matches;

/// Name of the default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
}

/// Whether a delivery is settled on receipt or must be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Manual,
}

/// Queue declaration options.
///
/// A queue without a name gets a broker-generated one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared queue with a fixed name.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            ..Self::default()
        }
    }

    /// Exclusive, auto-deleted queue with a fixed name.
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }

    /// Exclusive, auto-deleted queue with a broker-generated name.
    pub fn anonymous() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }
}

/// Broker trait for bus communication
pub trait Broker: Send + Sync {
    /// Declare an exchange; redeclaring with the same kind is a no-op.
    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), BusError>;

    /// Declare a queue and return its name.
    fn declare_queue(&self, options: QueueOptions) -> Result<String, BusError>;

    fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), BusError>;

    fn unbind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), BusError>;

    /// Delete a queue, dropping its messages and waking any receivers.
    fn delete_queue(&self, queue: &str) -> Result<(), BusError>;

    /// Publish a message; messages that match no binding are dropped.
    fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<(), BusError>;

    /// Take the next message from a queue, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout and `Err(QueueNotFound)` once the
    /// queue is gone, which lets consumer loops end.
    fn receive(
        &self,
        queue: &str,
        timeout: Duration,
        ack: AckMode,
    ) -> Result<Option<Delivery>, BusError>;

    /// Acknowledge a delivery received in manual mode.
    fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BusError>;

    /// Put every unacknowledged delivery of the queue back at its front.
    fn recover(&self, queue: &str) -> Result<(), BusError>;
}
