//! Meteor - multi-tenant round-robin job scheduler
//!
//! Clients submit scripts over a publish/subscribe bus; the scheduler runs
//! them fairly across clients, pushes every state change back to the
//! submitting client and streams result files in negotiated blocks.
//!
//! This crate holds the client session and client configuration, and
//! re-exports the protocol, bus and server crates.

pub mod client;
pub mod config;

pub use client::{
    ClientJob, ClientSession, CollectingHandler, JobStateListener, ResultFileHandler, SessionError, StatusUpdate,
    TransferHandle, TransferOutcome,
};
pub use config::{ClientConfig, ConfigError};

pub use meteor_bus as bus;
pub use meteor_protocol as protocol;
pub use meteor_server as server;
