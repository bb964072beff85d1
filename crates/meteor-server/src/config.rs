//! Scheduler configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use meteor_protocol::{routing, MAX_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

/// External program used to run job scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorCommand {
    /// Program to run; the script is written to its stdin.
    pub program: String,
    /// Extra arguments passed before any script input.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Scheduler configuration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Topic exchange carrying submissions, requests and registration.
    pub request_exchange: String,
    /// Direct exchange carrying status pushes.
    pub status_exchange: String,
    /// Durable queue consumed by the dispatcher.
    pub request_queue: String,
    /// How long one dispatcher tick waits for an inbound message.
    pub poll_timeout_ms: u64,
    /// Jobs executing at the same time.
    pub max_concurrent_jobs: usize,
    /// Upper bound on negotiated block sizes.
    pub max_block_size: u64,
    /// Prefix every client's output paths are mapped under.
    pub filesystem_root: String,
    pub executor: Option<ExecutorCommand>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_exchange: routing::REQUEST_EXCHANGE.to_string(),
            status_exchange: routing::STATUS_EXCHANGE.to_string(),
            request_queue: routing::REQUEST_QUEUE.to_string(),
            poll_timeout_ms: 100,
            max_concurrent_jobs: 4,
            max_block_size: MAX_BLOCK_SIZE,
            filesystem_root: "file:///var/lib/meteor/".to_string(),
            executor: None,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("request_exchange", &self.request_exchange),
            ("status_exchange", &self.status_exchange),
            ("request_queue", &self.request_queue),
        ] {
            if value.is_empty() {
                return Err(ConfigError::ValidationError(format!("{} must not be empty", key)));
            }
        }
        if self.request_exchange == self.status_exchange {
            return Err(ConfigError::ValidationError(
                "request_exchange and status_exchange must differ".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_jobs must be positive".to_string(),
            ));
        }
        if self.max_block_size == 0 || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_block_size must be in (0, {}]",
                MAX_BLOCK_SIZE
            )));
        }
        if self.filesystem_root.is_empty() {
            return Err(ConfigError::ValidationError(
                "filesystem_root must not be empty".to_string(),
            ));
        }
        if let Some(cmd) = &self.executor {
            if cmd.program.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "executor.program must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_queue, "scheduler.requests.queue");
        assert_eq!(config.max_block_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            max_concurrent_jobs = 2
            filesystem_root = "file:///srv/meteor/"

            [executor]
            program = "meteor-run"
            args = ["--quiet"]
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.poll_timeout_ms, 100);
        assert_eq!(config.executor.unwrap().args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = ServerConfig::from_toml_str("max_concurrent_jobs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_rejects_oversized_blocks() {
        let config = ServerConfig {
            max_block_size: MAX_BLOCK_SIZE + 1,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = ServerConfig::from_toml_str("max_concurrent_jobs = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "poll_timeout_ms = 25").unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_millis(25));
    }
}
