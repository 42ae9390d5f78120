//! # Nganya Common
//!
//! Shared configuration, error types, and logging setup for the Nganya Groove
//! offline asset cache.
//!
//! ## Features
//!
//! - Worker configuration loaded from JSON, defaulting to the deployed site
//! - Configuration errors
//! - Logging configuration and setup

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{LoaderSettings, LoggingSettings, WorkerConfig, DEFAULT_CACHE_NAME};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON for [`WorkerConfig`].
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the worker cannot run with.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid-value error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_message() {
        let err = ConfigError::invalid("cache_name is empty");
        assert_eq!(err.to_string(), "Invalid config: cache_name is empty");
    }

    #[test]
    fn test_parse_error_from_serde() {
        let err: ConfigError = serde_json::from_str::<WorkerConfig>("{").unwrap_err().into();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
