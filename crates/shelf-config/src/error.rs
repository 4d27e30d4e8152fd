//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("Failed to read config file {path}: {error}")]
    Io {
        /// Path that failed to load
        path: PathBuf,
        /// Underlying I/O error message
        error: String,
    },

    /// The config content could not be parsed
    #[error("Failed to parse {format} config: {error}")]
    Parse {
        /// Format that was being parsed (toml, json)
        format: &'static str,
        /// Parser error message
        error: String,
    },

    /// The config file extension is not a supported format
    #[error("Unsupported config format for {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),

    /// A value is out of range or inconsistent
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },
}

/// Specialized Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create an invalid-value error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
