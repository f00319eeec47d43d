use super::types::RateLimiter;
use crate::metrics;
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Window state for one key
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    last_refill: Instant,
    remaining: u32,
}

/// In-process rate limiter using a windowed token bucket per key.
///
/// Every bucket lives behind one mutex; this trades per-key parallelism for a
/// trivially linearizable check. Buckets are created on first sight of a key.
/// Counters are not shared across gateway instances.
pub struct MemoryRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    limit: u32,
    window: Duration,
}

impl MemoryRateLimiter {
    /// Create a new in-process rate limiter
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        let bucket = match buckets.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(TokenBucket {
                    last_refill: now,
                    remaining: self.limit.saturating_sub(1),
                });
                debug!(key, "Created token bucket");
                return true;
            }
        };

        if now.duration_since(bucket.last_refill) >= self.window {
            bucket.remaining = self.limit;
            bucket.last_refill = now;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Drop buckets whose window has fully elapsed.
    ///
    /// Such a bucket would be refilled on its next check anyway, so evicting
    /// it leaves every future verdict unchanged. Returns the number evicted.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < self.window);
        before - buckets.len()
    }

    /// Get the number of tracked keys (for testing/monitoring)
    pub fn active_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Periodically evict stale buckets until the limiter is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let evicted = limiter.sweep_stale();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.active_keys(), "Swept stale buckets");
                }
            }
            debug!("Rate limiter sweeper stopped");
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str) -> bool {
        let allowed = self.check(key);
        if !allowed {
            metrics::record_rate_limit_exceeded("key");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_limiter_allows_exactly_limit() {
        let limiter = MemoryRateLimiter::new(5, Duration::from_secs(60));

        for i in 0..5 {
            assert!(limiter.allow("10.0.0.1").await, "Request {} should be allowed", i);
        }

        assert!(!limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);
    }

    #[tokio::test]
    async fn test_memory_limiter_different_keys() {
        let limiter = MemoryRateLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);

        // key b is unaffected by a being exhausted
        assert!(limiter.allow("b").await);
        assert_eq!(limiter.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_memory_limiter_window_reset() {
        let limiter = MemoryRateLimiter::new(2, Duration::from_millis(100));

        assert!(limiter.allow("user").await);
        assert!(limiter.allow("user").await);
        assert!(!limiter.allow("user").await);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(limiter.allow("user").await);
        assert!(limiter.allow("user").await);
        assert!(!limiter.allow("user").await);
    }

    #[tokio::test]
    async fn test_limit_of_one() {
        let limiter = MemoryRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_sweep_only_evicts_elapsed_windows() {
        let limiter = MemoryRateLimiter::new(3, Duration::from_millis(100));
        assert!(limiter.allow("old").await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.allow("fresh").await);

        assert_eq!(limiter.sweep_stale(), 1);
        assert_eq!(limiter.active_keys(), 1);

        // a swept key behaves like a refilled one
        for _ in 0..3 {
            assert!(limiter.allow("old").await);
        }
        assert!(!limiter.allow("old").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_do_not_race() {
        let limiter = Arc::new(MemoryRateLimiter::new(100, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..1000 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.allow("shared").await }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 100);
    }
}
