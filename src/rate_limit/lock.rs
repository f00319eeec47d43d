use super::store::CounterStore;
use super::types::{lock_key, rate_key, RateLimiter};
use crate::error::Result;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lease of the per-key lock
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_millis(200);

/// Distributed rate limiter that serializes updates with a short-lived lock.
///
/// When the lock is already held the check is rejected immediately rather
/// than retried. Any store failure also rejects.
pub struct LockRateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u32,
    window: Duration,
    lease: Duration,
}

impl LockRateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// Override the lock lease
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn count_under_lock(&self, key: &str) -> Result<bool> {
        let counter = rate_key(key);
        let current = self.store.get_count(&counter).await?;
        if current >= i64::from(self.limit) {
            return Ok(false);
        }
        self.store.incr_and_refresh(&counter, self.window).await?;
        Ok(true)
    }
}

#[async_trait]
impl RateLimiter for LockRateLimiter {
    async fn allow(&self, key: &str) -> bool {
        let lock = lock_key(key);

        match self.store.try_lock(&lock, self.lease).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key, "Rate limit lock contended, rejecting");
                return false;
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to acquire rate limit lock");
                return false;
            }
        }

        let verdict = self.count_under_lock(key).await;

        if let Err(e) = self.store.unlock(&lock).await {
            // the lease bounds how long a leaked lock can block this key
            warn!(key, error = %e, "Failed to release rate limit lock");
        }

        match verdict {
            Ok(true) => true,
            Ok(false) => {
                metrics::record_rate_limit_exceeded("key");
                false
            }
            Err(e) => {
                warn!(key, error = %e, "Store error during lock-based rate limit check");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::LocalCounterStore;

    #[tokio::test]
    async fn test_lock_limiter_allows_up_to_limit() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = LockRateLimiter::new(store, 3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.allow("10.0.0.1").await);
        }
        assert!(!limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_lock_limiter_rejects_on_contention() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = LockRateLimiter::new(store.clone(), 10, Duration::from_secs(60));

        // another instance holds the lock for this key
        assert!(store
            .try_lock("lock:busy", Duration::from_secs(5))
            .await
            .unwrap());

        assert!(!limiter.allow("busy").await);
        assert_eq!(store.get_count("rate:busy").await.unwrap(), 0);

        store.unlock("lock:busy").await.unwrap();
        assert!(limiter.allow("busy").await);
    }

    #[tokio::test]
    async fn test_lock_released_after_rejection() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = LockRateLimiter::new(store.clone(), 1, Duration::from_secs(60));

        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        // the early return above must not leave the lock behind
        assert!(store.try_lock("lock:k", Duration::from_secs(1)).await.unwrap());
    }
}
