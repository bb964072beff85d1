//! Bus errors

use crate::ExchangeKind;

/// Errors raised by broker operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Exchange {name} already declared as {existing:?}, not {requested:?}")]
    ExchangeMismatch {
        name: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },

    #[error("Queue {0} is exclusive to another declaration")]
    QueueLocked(String),

    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDeliveryTag { queue: String, tag: u64 },

    #[error("Cannot bind to the default exchange")]
    DefaultExchangeBinding,

    #[error("Broker closed")]
    Closed,
}
