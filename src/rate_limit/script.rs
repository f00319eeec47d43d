use super::store::CounterStore;
use super::types::{rate_key, RateLimiter};
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Distributed rate limiter backed by one atomic increment-and-compare.
///
/// The whole check runs as a single server-side script, so no lock is
/// needed. Store errors reject the request.
pub struct ScriptRateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u32,
    window: Duration,
}

impl ScriptRateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }
}

#[async_trait]
impl RateLimiter for ScriptRateLimiter {
    async fn allow(&self, key: &str) -> bool {
        match self
            .store
            .incr_within_limit(&rate_key(key), self.limit, self.window)
            .await
        {
            Ok(allowed) => {
                if !allowed {
                    debug!(key, limit = self.limit, "Rate limit exceeded (script)");
                    metrics::record_rate_limit_exceeded("key");
                }
                allowed
            }
            Err(e) => {
                error!(key, error = %e, "Store error during rate limit check, rejecting");
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
    async fn test_script_limiter_allows_up_to_limit() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = ScriptRateLimiter::new(store, 4, Duration::from_secs(60));

        for i in 0..4 {
            assert!(limiter.allow("route").await, "Request {} should be allowed", i);
        }
        assert!(!limiter.allow("route").await);
    }

    #[tokio::test]
    async fn test_script_limiter_window_reset() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = ScriptRateLimiter::new(store, 1, Duration::from_millis(100));

        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.allow("k").await);
    }
}
