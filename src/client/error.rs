//! Client session errors.

use std::time::Duration;

use meteor_bus::BusError;
use meteor_protocol::{ErrorCode, IdError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    #[error("client id '{0}' is still registered")]
    DuplicateRegistration(String),

    #[error("no registration reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("session is not connected")]
    NotConnected,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The scheduler answered with an ERROR envelope.
    #[error("scheduler refused request: {message}")]
    Remote {
        code: Option<ErrorCode>,
        message: String,
    },

    #[error("could not start consumer thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl SessionError {
    pub fn is_duplicate_registration(&self) -> bool {
        matches!(self, SessionError::DuplicateRegistration(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
