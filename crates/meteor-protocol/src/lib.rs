//! Meteor Protocol Types
//!
//! Defines the messages exchanged between scheduler clients and the
//! scheduler over the publish/subscribe bus: the structured request
//! envelope, job states, routing keys and the chunked result transfer.

pub mod envelope;
pub mod error;
pub mod job_state;
pub mod routing;
pub mod transfer;

pub use envelope::{Envelope, RequestCode};
pub use error::ErrorCode;
pub use job_state::JobState;
pub use routing::{IdError, Topic};
pub use transfer::{BlockPlan, NegotiationError, ResultFileBlock};

/// Content type of structured (JSON) message bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of plain-text bodies (handshake replies, client ids).
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Content type of raw result blocks.
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Encoding used when a message does not name one.
pub const DEFAULT_ENCODING: &str = "UTF-8";

/// Largest block the scheduler will send back in one message (100 MiB).
pub const MAX_BLOCK_SIZE: u64 = 100 * 1024 * 1024;
