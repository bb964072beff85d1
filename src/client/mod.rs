//! Client side of the scheduler protocol.
//!
//! A `ClientSession` registers a client id with the scheduler, mirrors the
//! state of the jobs it submits and consumes correlated replies, including
//! chunked result transfers.

pub mod error;
pub mod job;
pub mod session;
mod status;
pub mod transfer;

pub use error::SessionError;
pub use job::{ClientJob, JobStateListener, StatusUpdate};
pub use session::ClientSession;
pub use transfer::{CollectingHandler, LinkHandle, ResultFileHandler, TransferHandle, TransferOutcome};
