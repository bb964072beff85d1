//! Meteor scheduler server.
//!
//! Accepts job submissions from many clients over the bus, runs them in
//! round-robin order across clients, pushes state changes to each client's
//! status binding and streams result files back in negotiated blocks.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod file_sender;
pub mod filesystem;
pub mod handlers;
pub mod job;
pub mod round_robin;
pub mod script;
pub mod session;
pub mod state;

pub use config::{ConfigError, ExecutorCommand, ServerConfig};
pub use dispatcher::{Scheduler, SchedulerHandle};
pub use error::{RequestError, ServerError};
pub use executor::{CommandExecutor, ExecutorError, QueryExecutor};
pub use filesystem::{ByteSource, ByteStream, FileSystems, FsError, LocalFileSystem, MemoryFileSystem};
pub use job::ServerJob;
pub use round_robin::RoundRobin;
pub use script::{MappedScript, MappingError, ScriptMapper};
pub use session::{BLOCK_INDEX_HEADER, BLOCK_TOTAL_HEADER};
