use std::time::Duration;

use async_trait::async_trait;
use common::exponential_backoff;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Proof of holding a lock, required to renew or release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// Creates a new random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing token value, e.g. one read back from storage.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contract for business-key lock backends.
///
/// `acquire` must be atomic acquire-if-absent-or-expired: at most one caller
/// holds a key at any instant, and an expired entry may be taken over.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Tries once to take the lock on `key` for `ttl`.
    ///
    /// Returns `None` if another holder has an unexpired lock.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases the lock if `token` still holds it.
    ///
    /// Returns false if the lock had expired or was taken over.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;

    /// Extends the expiry of a held lock to `ttl` from now.
    ///
    /// Returns false if `token` no longer holds the lock.
    async fn renew(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool>;
}

/// How long and how often to retry a busy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Total number of acquire attempts, including the first one.
    pub attempts: u32,
    /// Delay after the first busy attempt; doubles on each further attempt.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Extension trait providing a bounded-wait acquire on every provider.
#[async_trait]
pub trait LockProviderExt: LockProvider {
    /// Acquires `key`, retrying with exponential backoff while it is busy.
    ///
    /// Returns `None` once `options.attempts` attempts have all found the key
    /// busy.
    async fn acquire_with_backoff(
        &self,
        key: &str,
        ttl: Duration,
        options: AcquireOptions,
    ) -> Result<Option<LockToken>> {
        let attempts = options.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(token) = self.acquire(key, ttl).await? {
                if attempt > 1 {
                    tracing::debug!(key, attempt, "lock acquired after waiting");
                }
                return Ok(Some(token));
            }
            if attempt < attempts {
                let delay = exponential_backoff(attempt, options.base_delay, options.max_delay);
                tokio::time::sleep(delay).await;
            }
        }
        metrics::counter!("lock_acquire_timeouts_total").increment(1);
        Ok(None)
    }
}

// Blanket implementation for all LockProvider implementations
impl<T: LockProvider + ?Sized> LockProviderExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }

    #[test]
    fn token_from_string_roundtrip() {
        let token = LockToken::from_string("abc");
        assert_eq!(token.as_str(), "abc");
        assert_eq!(token.to_string(), "abc");
    }

    #[test]
    fn default_acquire_options() {
        let options = AcquireOptions::default();
        assert_eq!(options.attempts, 10);
        assert!(options.base_delay < options.max_delay);
    }
}
