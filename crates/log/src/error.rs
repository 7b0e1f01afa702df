use std::time::Duration;

use leaselog_core::ConfigError;
use thiserror::Error;

/// Shared log operation error.
///
/// `LockTimeout` may be retried by the caller; `CapacityExceeded` and
/// `Corrupt` require operator intervention.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("timed out after {waited:?} waiting for exclusive access to log '{log}'")]
    LockTimeout { log: String, waited: Duration },

    #[error("log '{log}' is full: {needed} bytes requested, {remaining} of {capacity} bytes remaining")]
    CapacityExceeded {
        log: String,
        needed: u64,
        remaining: u64,
        capacity: u64,
    },

    #[error("log '{0}' is closed")]
    Closed(String),

    #[error("empty records cannot be appended to log '{0}'")]
    EmptyRecord(String),

    #[error("log '{log}' is corrupt at offset {offset}: {reason}")]
    Corrupt {
        log: String,
        offset: u64,
        reason: String,
    },

    #[error("record encoding failed: {0}")]
    Codec(String),

    #[error("i/o error on log '{log}': {source}")]
    Io {
        log: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LogError {
    pub(crate) fn io(log: &str, source: std::io::Error) -> Self {
        Self::Io {
            log: log.to_string(),
            source,
        }
    }

    pub(crate) fn corrupt(log: &str, offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            log: log.to_string(),
            offset,
            reason: reason.into(),
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
