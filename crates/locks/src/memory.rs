use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{LockProvider, LockToken, Result};

#[derive(Debug, Clone)]
struct LockEntry {
    token: LockToken,
    expires_at: Instant,
}

/// In-memory lock provider for tests and single-process deployments.
///
/// Expiry uses the tokio clock, so paused-time tests can expire locks
/// deterministically.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl InMemoryLockProvider {
    /// Creates a provider with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is held by an unexpired lock.
    pub async fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Returns the number of unexpired locks.
    pub async fn held_count(&self) -> usize {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        locks.values().filter(|entry| entry.expires_at > now).count()
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;

        if let Some(entry) = locks.get(key)
            && entry.expires_at > now
        {
            return Ok(None);
        }

        let token = LockToken::generate();
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if &entry.token == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get_mut(key) {
            Some(entry) if &entry.token == token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AcquireOptions, LockProviderExt};

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let provider = InMemoryLockProvider::new();

        let token = provider.acquire("cart:1", TTL).await.unwrap();
        assert!(token.is_some());
        assert!(provider.acquire("cart:1", TTL).await.unwrap().is_none());
        // Other keys are independent
        assert!(provider.acquire("cart:2", TTL).await.unwrap().is_some());
        assert_eq!(provider.held_count().await, 2);
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let provider = InMemoryLockProvider::new();
        let token = provider.acquire("cart:1", TTL).await.unwrap().unwrap();

        let stranger = LockToken::generate();
        assert!(!provider.release("cart:1", &stranger).await.unwrap());
        assert!(provider.is_locked("cart:1").await);

        assert!(provider.release("cart:1", &token).await.unwrap());
        assert!(!provider.is_locked("cart:1").await);
        assert!(provider.acquire("cart:1", TTL).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let provider = InMemoryLockProvider::new();
        let first = provider
            .acquire("cart:1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let second = provider.acquire("cart:1", TTL).await.unwrap().unwrap();
        assert_ne!(first, second);
        // The original holder can neither renew nor release any more
        assert!(!provider.renew("cart:1", &first, TTL).await.unwrap());
        assert!(!provider.release("cart:1", &first).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_expiry() {
        let provider = InMemoryLockProvider::new();
        let token = provider
            .acquire("cart:1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(
            provider
                .renew("cart:1", &token, Duration::from_secs(5))
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(provider.is_locked("cart:1").await);
        assert!(provider.acquire("cart:1", TTL).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_backoff_waits_for_release() {
        let provider = InMemoryLockProvider::new();
        let token = provider.acquire("cart:1", TTL).await.unwrap().unwrap();

        let releaser = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            releaser.release("cart:1", &token).await.unwrap();
        });

        let acquired = provider
            .acquire_with_backoff("cart:1", TTL, AcquireOptions::default())
            .await
            .unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_backoff_gives_up() {
        let provider = InMemoryLockProvider::new();
        provider.acquire("cart:1", TTL).await.unwrap().unwrap();

        let options = AcquireOptions {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };
        let acquired = provider
            .acquire_with_backoff("cart:1", TTL, options)
            .await
            .unwrap();
        assert!(acquired.is_none());
    }
}
