//! Configuration error model.

use thiserror::Error;

/// Result type used for synchronous argument validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration-level error.
///
/// Raised synchronously, before any log I/O happens, when a caller supplies a
/// name, identity or size the storage layer cannot accept.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A log or dictionary name was empty or not alphanumeric.
    #[error("invalid log name '{0}': names must be non-empty and ASCII alphanumeric")]
    InvalidLogName(String),

    /// A dispatcher identity was rejected (empty, or over the configured limit).
    #[error("invalid dispatcher identity: {0}")]
    InvalidDispatcherId(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A numeric or duration setting was out of range.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

impl ConfigError {
    pub fn invalid_log_name(name: impl Into<String>) -> Self {
        Self::InvalidLogName(name.into())
    }

    pub fn invalid_dispatcher(msg: impl Into<String>) -> Self {
        Self::InvalidDispatcherId(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_setting(msg: impl Into<String>) -> Self {
        Self::InvalidSetting(msg.into())
    }
}
