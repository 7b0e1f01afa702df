//! Opaque stream state tokens for optimistic concurrency.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TOKEN_LEN: usize = 8;

/// Server-issued token identifying a stream's current revision.
///
/// Tokens are random rather than derived from content or position, so a
/// client can only present a token it actually read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateToken(String);

impl StateToken {
    /// Issue a fresh, unpredictable token.
    pub fn generate() -> Self {
        let mut token = Uuid::new_v4().simple().to_string();
        token.truncate(TOKEN_LEN);
        Self(token)
    }

    /// Wrap a token previously returned by the store (e.g. round-tripped through a client).
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for StateToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_are_short_hex() {
        let token = StateToken::generate();
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_tokens_do_not_repeat() {
        let tokens: HashSet<_> = (0..1000).map(|_| StateToken::generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }
}
