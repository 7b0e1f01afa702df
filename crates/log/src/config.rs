//! Log naming and configuration.

use std::path::PathBuf;
use std::time::Duration;

use leaselog_core::{ConfigError, ConfigResult};

/// Default size of a log's data region (10 MiB).
pub const DEFAULT_CAPACITY: u64 = 10 * 1024 * 1024;

/// Default bound on waiting for the writer lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_NAMESPACE: &str = "leaselog";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Validated name of a log (or of the dictionary stored in it).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogName(String);

impl LogName {
    pub fn new(name: impl Into<String>) -> ConfigResult<Self> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::invalid_log_name(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LogName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settings shared by every log opened through one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Directory holding memory-mapped log and lock files.
    pub directory: PathBuf,
    /// Prefix shared by every named object (region, lock, signal).
    pub namespace: String,
    /// Size of the data region in bytes; fixed once a log is created.
    pub capacity: u64,
    /// Bounded wait for the exclusive writer lock.
    pub lock_timeout: Duration,
    /// Polling period for cross-process lock and change detection.
    pub poll_interval: Duration,
    /// msync each append before returning.
    pub flush_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join(DEFAULT_NAMESPACE),
            namespace: DEFAULT_NAMESPACE.to_string(),
            capacity: DEFAULT_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            flush_on_append: true,
        }
    }
}

impl LogConfig {
    /// Build a config from `LEASELOG_*` environment variables, falling back to defaults.
    ///
    /// - `LEASELOG_DIR`
    /// - `LEASELOG_NAMESPACE`
    /// - `LEASELOG_CAPACITY_BYTES`
    /// - `LEASELOG_LOCK_TIMEOUT_MS`
    /// - `LEASELOG_POLL_INTERVAL_MS`
    /// - `LEASELOG_FLUSH_ON_APPEND` (`true`/`false`)
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("LEASELOG_DIR") {
            config.directory = PathBuf::from(dir);
        }
        if let Ok(namespace) = std::env::var("LEASELOG_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(capacity) = env_parse::<u64>("LEASELOG_CAPACITY_BYTES")? {
            config.capacity = capacity;
        }
        if let Some(ms) = env_parse::<u64>("LEASELOG_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LEASELOG_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(flush) = env_parse::<bool>("LEASELOG_FLUSH_ON_APPEND")? {
            config.flush_on_append = flush;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::invalid_setting(format!(
                "namespace '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.namespace
            )));
        }
        if self.capacity < 64 {
            return Err(ConfigError::invalid_setting(format!(
                "capacity {} is below the 64 byte minimum",
                self.capacity
            )));
        }
        if self.capacity > u64::from(u32::MAX) {
            return Err(ConfigError::invalid_setting(format!(
                "capacity {} exceeds the {} byte maximum",
                self.capacity,
                u32::MAX
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::invalid_setting("lock timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid_setting("poll interval must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> ConfigResult<Option<T>>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid_setting(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
