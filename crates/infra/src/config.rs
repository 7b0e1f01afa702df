//! Store-level configuration.

use std::time::Duration;

use leaselog_core::{ConfigError, ConfigResult, DispatcherId, PORTABLE_DISPATCHER_ID_MAX_LEN};
use leaselog_log::{LogConfig, LogName};

/// Unacknowledged leases older than this are re-issued.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Names and policies of the logs backing one event store deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub log: LogConfig,
    pub events_log: String,
    pub leases_log: String,
    pub watermarks_log: String,
    pub lease_timeout: Duration,
    /// Reject dispatcher ids longer than this, if set.
    pub max_dispatcher_id_len: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            events_log: "Events".to_string(),
            leases_log: "Batches".to_string(),
            watermarks_log: "Watermarks".to_string(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            max_dispatcher_id_len: None,
        }
    }
}

impl StoreConfig {
    /// `LogConfig::from_env` plus:
    ///
    /// - `LEASELOG_LEASE_TIMEOUT_SECS`
    /// - `LEASELOG_DISPATCHER_ID_MAX_LEN` (`portable` selects the 10 character limit)
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self {
            log: LogConfig::from_env()?,
            ..Self::default()
        };

        if let Ok(raw) = std::env::var("LEASELOG_LEASE_TIMEOUT_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::invalid_setting(format!("LEASELOG_LEASE_TIMEOUT_SECS={raw}: {e}"))
            })?;
            config.lease_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("LEASELOG_DISPATCHER_ID_MAX_LEN") {
            config.max_dispatcher_id_len = Some(parse_id_limit(&raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Restrict dispatcher ids to what every storage backend accepts.
    pub fn portable(mut self) -> Self {
        self.max_dispatcher_id_len = Some(PORTABLE_DISPATCHER_ID_MAX_LEN);
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.log.validate()?;
        for name in [&self.events_log, &self.leases_log, &self.watermarks_log] {
            LogName::new(name.as_str())?;
        }
        if self.events_log == self.leases_log
            || self.events_log == self.watermarks_log
            || self.leases_log == self.watermarks_log
        {
            return Err(ConfigError::invalid_setting("log names must be distinct"));
        }
        if self.lease_timeout.is_zero() {
            return Err(ConfigError::invalid_setting("lease timeout must be positive"));
        }
        if self.max_dispatcher_id_len == Some(0) {
            return Err(ConfigError::invalid_setting(
                "dispatcher id limit must be positive",
            ));
        }
        Ok(())
    }

    /// Apply the configured id limit to `dispatcher`.
    pub fn check_dispatcher(&self, dispatcher: &DispatcherId) -> ConfigResult<()> {
        match self.max_dispatcher_id_len {
            Some(max) => dispatcher.ensure_max_len(max),
            None => Ok(()),
        }
    }
}

fn parse_id_limit(raw: &str) -> ConfigResult<usize> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("portable") {
        return Ok(PORTABLE_DISPATCHER_ID_MAX_LEN);
    }
    raw.parse::<usize>().map_err(|e| {
        ConfigError::invalid_setting(format!("LEASELOG_DISPATCHER_ID_MAX_LEN={raw}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_timeout, Duration::from_secs(30));
        assert_eq!(config.max_dispatcher_id_len, None);
    }

    #[test]
    fn log_names_must_differ() {
        let config = StoreConfig {
            leases_log: "Events".to_string(),
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn portable_limit_applies_to_dispatchers() {
        let config = StoreConfig::default().portable();
        assert!(config.check_dispatcher(&DispatcherId::new("billing").unwrap()).is_ok());
        assert!(matches!(
            config.check_dispatcher(&DispatcherId::new("notifications").unwrap()),
            Err(ConfigError::InvalidDispatcherId(_))
        ));
        assert!(config.check_dispatcher(&DispatcherId::default_group()).is_ok());
    }

    #[test]
    fn id_limit_accepts_numbers_and_portable() {
        assert_eq!(parse_id_limit("portable").unwrap(), 10);
        assert_eq!(parse_id_limit(" 32 ").unwrap(), 32);
        assert!(parse_id_limit("ten").is_err());
    }
}
