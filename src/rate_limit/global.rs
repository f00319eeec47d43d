use super::store::CounterStore;
use super::types::{RateLimiter, GLOBAL_KEY};
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Process-wide ceiling layered in front of a per-key strategy.
///
/// A key must pass both gates; the ceiling is evaluated first. Whitelisted
/// keys skip the ceiling but still go through the wrapped strategy. When the
/// counter store fails the ceiling is skipped (fail-open), unlike the
/// distributed per-key strategies which reject on store failure.
pub struct GlobalRateLimiter {
    inner: Arc<dyn RateLimiter>,
    store: Option<Arc<dyn CounterStore>>,
    global_limit: u32,
    window: Duration,
    whitelist: HashSet<String>,
}

impl GlobalRateLimiter {
    /// Wrap `inner` with a ceiling of `global_limit` admissions per `window`.
    /// A limit of zero or a missing store disables the ceiling.
    pub fn new(
        inner: Arc<dyn RateLimiter>,
        store: Option<Arc<dyn CounterStore>>,
        global_limit: u32,
        window: Duration,
        whitelist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            inner,
            store,
            global_limit,
            window,
            whitelist: whitelist.into_iter().collect(),
        }
    }

    /// Whether a key bypasses the ceiling
    pub fn is_whitelisted(&self, key: &str) -> bool {
        self.whitelist.contains(key)
    }

    /// Whether the ceiling is in force
    pub fn is_enforcing(&self) -> bool {
        self.global_limit > 0 && self.store.is_some()
    }
}

#[async_trait]
impl RateLimiter for GlobalRateLimiter {
    async fn allow(&self, key: &str) -> bool {
        if self.is_whitelisted(key) {
            debug!(key, "Whitelisted key, skipping global limit");
            return self.inner.allow(key).await;
        }

        let store = match &self.store {
            Some(store) if self.global_limit > 0 => store,
            _ => return self.inner.allow(key).await,
        };

        match store.incr_window(GLOBAL_KEY, self.window).await {
            Ok(count) if count > i64::from(self.global_limit) => {
                debug!(key, count, limit = self.global_limit, "Global rate limit exceeded");
                metrics::record_rate_limit_exceeded("global");
                false
            }
            Ok(_) => self.inner.allow(key).await,
            Err(e) => {
                warn!(error = %e, "Global rate limit store unavailable, skipping ceiling");
                self.inner.allow(key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, Result};
    use crate::rate_limit::memory::MemoryRateLimiter;
    use crate::rate_limit::store::LocalCounterStore;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn incr_window(&self, _key: &str, _window: Duration) -> Result<i64> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
        async fn incr_within_limit(&self, _: &str, _: u32, _: Duration) -> Result<bool> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
        async fn try_lock(&self, _key: &str, _lease: Duration) -> Result<bool> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
        async fn unlock(&self, _key: &str) -> Result<()> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
        async fn get_count(&self, _key: &str) -> Result<i64> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
        async fn incr_and_refresh(&self, _key: &str, _window: Duration) -> Result<i64> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
    }

    fn per_key(limit: u32) -> Arc<dyn RateLimiter> {
        Arc::new(MemoryRateLimiter::new(limit, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_global_ceiling_applies_across_keys() {
        let limiter = GlobalRateLimiter::new(
            per_key(100),
            Some(Arc::new(LocalCounterStore::new())),
            3,
            Duration::from_secs(60),
            vec![],
        );

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("b").await);
        assert!(limiter.allow("c").await);
        assert!(!limiter.allow("d").await);
        assert!(!limiter.allow("a").await);
    }

    #[tokio::test]
    async fn test_whitelist_skips_ceiling_but_not_per_key_limit() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = GlobalRateLimiter::new(
            per_key(2),
            Some(store.clone()),
            1,
            Duration::from_secs(60),
            vec!["trusted".to_string()],
        );

        // exhaust the ceiling
        assert!(limiter.allow("other").await);
        assert!(!limiter.allow("other-2").await);

        assert!(limiter.allow("trusted").await);
        assert!(limiter.allow("trusted").await);
        assert!(!limiter.allow("trusted").await);

        // whitelisted checks never touch the shared counter
        assert_eq!(store.get_count(GLOBAL_KEY).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disabled_ceiling_delegates() {
        let limiter = GlobalRateLimiter::new(
            per_key(1),
            Some(Arc::new(LocalCounterStore::new())),
            0,
            Duration::from_secs(60),
            vec![],
        );
        assert!(!limiter.is_enforcing());
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        assert!(limiter.allow("b").await);
    }

    #[tokio::test]
    async fn test_missing_store_delegates() {
        let limiter = GlobalRateLimiter::new(per_key(5), None, 1, Duration::from_secs(60), vec![]);
        assert!(!limiter.is_enforcing());
        for _ in 0..5 {
            assert!(limiter.allow("a").await);
        }
        assert!(!limiter.allow("a").await);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open() {
        let limiter = GlobalRateLimiter::new(
            per_key(1000),
            Some(Arc::new(UnreachableStore)),
            1,
            Duration::from_secs(60),
            vec![],
        );

        for i in 0..10 {
            assert!(limiter.allow(&format!("key-{}", i)).await);
        }
    }

    #[tokio::test]
    async fn test_ceiling_rejection_skips_inner_strategy() {
        let inner = Arc::new(MemoryRateLimiter::new(10, Duration::from_secs(60)));
        let limiter = GlobalRateLimiter::new(
            inner.clone(),
            Some(Arc::new(LocalCounterStore::new())),
            1,
            Duration::from_secs(60),
            vec![],
        );

        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("b").await);

        // b was rejected by the ceiling before reaching the per-key strategy
        assert_eq!(inner.active_keys(), 1);
    }
}
