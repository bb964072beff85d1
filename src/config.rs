//! Client configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use meteor_protocol::{routing, DEFAULT_ENCODING};
use serde::{Deserialize, Serialize};

/// Settings for one client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Topic exchange the scheduler listens on.
    pub request_exchange: String,
    /// How long `connect` waits for the registration reply.
    pub handshake_timeout_ms: u64,
    /// Idle time after which link and result consumers give up.
    pub reply_timeout_ms: u64,
    /// Status updates buffered for `next_status` before new ones are dropped.
    pub status_backlog: usize,
    /// Content encoding announced on outgoing messages.
    pub encoding: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_exchange: routing::REQUEST_EXCHANGE.to_string(),
            handshake_timeout_ms: 5000,
            reply_timeout_ms: 5000,
            status_backlog: 256,
            encoding: DEFAULT_ENCODING.to_string(),
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_exchange.is_empty() {
            return Err(ConfigError::ValidationError(
                "request_exchange must not be empty".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.reply_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reply_timeout_ms must be positive".to_string(),
            ));
        }
        if self.status_backlog == 0 {
            return Err(ConfigError::ValidationError(
                "status_backlog must be positive".to_string(),
            ));
        }
        if self.encoding.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "encoding must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
