//! Shared counter primitives.
//!
//! Distributed strategies only touch their counters through [`CounterStore`],
//! whose operations are each atomic on the backing store. The Redis-backed
//! implementation lives in [`crate::store`]; [`LocalCounterStore`] provides the
//! same contract inside one process.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Atomic counter and lock operations used by the distributed strategies
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`; the first increment of a window sets its expiry.
    /// Returns the post-increment value.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64>;

    /// Increment `key` as in [`incr_window`](Self::incr_window) and report
    /// whether the post-increment value is within `limit`, as one operation.
    async fn incr_within_limit(&self, key: &str, limit: u32, window: Duration) -> Result<bool>;

    /// Take an exclusive lease on `key`. Returns false when already held.
    async fn try_lock(&self, key: &str, lease: Duration) -> Result<bool>;

    /// Release a lease taken with [`try_lock`](Self::try_lock)
    async fn unlock(&self, key: &str) -> Result<()>;

    /// Current value of `key`, zero when absent or expired
    async fn get_count(&self, key: &str) -> Result<i64>;

    /// Increment `key` and reset its expiry to `window`, as one transaction
    async fn incr_and_refresh(&self, key: &str, window: Duration) -> Result<i64>;
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            value: 0,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    fn reset_if_expired(&mut self, now: Instant) {
        if self.is_expired(now) {
            *self = Self::empty();
        }
    }
}

/// In-process [`CounterStore`] with expiring entries.
///
/// Each operation holds the entry's shard lock for its whole duration, which
/// gives the same per-key atomicity as a server-side script.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    slots: DashMap<String, Slot>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn incr(&self, key: &str, window: Duration) -> i64 {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(Slot::empty);
        slot.reset_if_expired(now);
        slot.value += 1;
        if slot.value == 1 {
            slot.expires_at = Some(now + window);
        }
        slot.value
    }

    /// Number of live entries (for testing/monitoring)
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64> {
        Ok(self.incr(key, window))
    }

    async fn incr_within_limit(&self, key: &str, limit: u32, window: Duration) -> Result<bool> {
        Ok(self.incr(key, window) <= i64::from(limit))
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(Slot::empty);
        slot.reset_if_expired(now);
        if slot.value > 0 {
            return Ok(false);
        }
        *slot = Slot {
            value: 1,
            expires_at: Some(now + lease),
        };
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn get_count(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value)
            .unwrap_or(0))
    }

    async fn incr_and_refresh(&self, key: &str, window: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(Slot::empty);
        slot.reset_if_expired(now);
        slot.value += 1;
        slot.expires_at = Some(now + window);
        Ok(slot.value)
    }
}
