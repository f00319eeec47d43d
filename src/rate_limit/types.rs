use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Key prefix for per-key distributed counters
pub const RATE_KEY_PREFIX: &str = "rate:";
/// Key prefix for per-key distributed locks
pub const LOCK_KEY_PREFIX: &str = "lock:";
/// Key of the process-wide shared counter
pub const GLOBAL_KEY: &str = "ratelimit:global";

/// Admission control capability.
///
/// `allow` answers with a verdict and never returns an error; each strategy
/// decides how a store failure maps onto allow or reject. Implementations must
/// be safe to call concurrently from many connections and must not block
/// indefinitely.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, key: &str) -> bool;
}

/// Per-key strategy selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
    /// In-process windowed token bucket
    #[default]
    Memory,
    /// Distributed counter guarded by a short-lived lock
    RedisLock,
    /// Distributed counter updated by one server-side script
    RedisLua,
}

impl fmt::Display for LimiterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimiterMode::Memory => "memory",
            LimiterMode::RedisLock => "redis_lock",
            LimiterMode::RedisLua => "redis_lua",
        };
        f.write_str(name)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-key strategy
    #[serde(default)]
    pub mode: LimiterMode,
    /// Admissions allowed per key per window
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Process-wide ceiling per window (0 disables it)
    #[serde(default)]
    pub global_limit: u32,
    /// Keys exempt from the global ceiling
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Lease of the per-key lock used by the lock strategy
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// How often the in-process strategy evicts idle keys (0 disables it)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_limit() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    1000
}

fn default_lock_lease_ms() -> u64 {
    200
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            mode: LimiterMode::default(),
            limit: default_limit(),
            window_ms: default_window_ms(),
            global_limit: 0,
            whitelist: vec![],
            lock_lease_ms: default_lock_lease_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Get the lock lease as a Duration
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

/// Counter key for a per-key strategy
pub fn rate_key(key: &str) -> String {
    format!("{}{}", RATE_KEY_PREFIX, key)
}

/// Lock key for the lock strategy
pub fn lock_key(key: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, key)
}
