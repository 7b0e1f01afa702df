//! Dispatcher (consumer group) identity.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Identity length accepted by every storage backend.
///
/// Relational backends store the identity in a `varchar(10)` column; callers
/// that need portability configure this as their limit.
pub const PORTABLE_DISPATCHER_ID_MAX_LEN: usize = 10;

const DEFAULT_GROUP: &str = "$default";

/// Name of an independent consumer group.
///
/// Callers that do not name their dispatcher share the implicit default
/// group. At the storage layer the default group is an ordinary identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatcherId(String);

impl DispatcherId {
    pub fn new(id: impl Into<String>) -> ConfigResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfigError::invalid_dispatcher("identity must not be empty"));
        }
        if id.chars().any(char::is_control) {
            return Err(ConfigError::invalid_dispatcher(format!(
                "identity '{}' contains control characters",
                id.escape_debug()
            )));
        }
        Ok(Self(id))
    }

    /// The well-known identity used when no dispatcher is named.
    pub fn default_group() -> Self {
        Self(DEFAULT_GROUP.to_string())
    }

    /// Map an optional caller-supplied identity, falling back to the default group.
    pub fn from_option(id: Option<&str>) -> ConfigResult<Self> {
        match id {
            Some(id) => Self::new(id),
            None => Ok(Self::default_group()),
        }
    }

    pub fn is_default_group(&self) -> bool {
        self.0 == DEFAULT_GROUP
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject identities longer than `max_len` characters.
    ///
    /// The default group is exempt: it never reaches a backend as a literal.
    pub fn ensure_max_len(&self, max_len: usize) -> ConfigResult<()> {
        if self.is_default_group() {
            return Ok(());
        }
        let len = self.0.chars().count();
        if len > max_len {
            return Err(ConfigError::invalid_dispatcher(format!(
                "identity '{}' is {len} characters long; the limit is {max_len}",
                self.0
            )));
        }
        Ok(())
    }
}

impl Default for DispatcherId {
    fn default() -> Self {
        Self::default_group()
    }
}

impl core::fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DispatcherId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
