//! Rate limiting module
//!
//! Admission control is a single capability, [`RateLimiter::allow`], with
//! three interchangeable per-key strategies:
//!
//! - **Memory**: windowed token bucket inside the process (fastest, not shared)
//! - **Lock**: shared counter updated under a short-lived distributed lock
//! - **Script**: shared counter updated by one atomic server-side script
//!
//! Any strategy can be wrapped by [`GlobalRateLimiter`], which adds a
//! process-wide ceiling and a whitelist that bypasses it.
//!
//! # Failure direction
//!
//! Store errors are never surfaced to callers. The global ceiling fails open,
//! while the lock and script strategies fail closed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use translate_gateway::rate_limit::{build_limiter, LocalCounterStore, RateLimitConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RateLimitConfig {
//!         limit: 10,
//!         global_limit: 1000,
//!         ..Default::default()
//!     };
//!
//!     let limiter = build_limiter(&config, Arc::new(LocalCounterStore::new()));
//!     assert!(limiter.allow("203.0.113.7").await);
//! }
//! ```

pub mod global;
pub mod lock;
pub mod lua_scripts;
pub mod memory;
pub mod script;
pub mod store;
pub mod types;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// Re-export commonly used types
pub use global::GlobalRateLimiter;
pub use lock::LockRateLimiter;
pub use memory::MemoryRateLimiter;
pub use script::ScriptRateLimiter;
pub use store::{CounterStore, LocalCounterStore};
pub use types::{LimiterMode, RateLimitConfig, RateLimiter};

/// Build the configured per-key strategy wrapped in the global ceiling.
///
/// `store` backs the distributed strategies and the global counter. The
/// memory strategy starts a background sweeper when configured.
pub fn build_limiter(
    config: &RateLimitConfig,
    store: Arc<dyn CounterStore>,
) -> Arc<GlobalRateLimiter> {
    let window = config.window();

    let per_key: Arc<dyn RateLimiter> = match config.mode {
        LimiterMode::Memory => {
            let limiter = Arc::new(MemoryRateLimiter::new(config.limit, window));
            if config.sweep_interval_secs > 0 {
                limiter.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            }
            limiter
        }
        LimiterMode::RedisLock => Arc::new(
            LockRateLimiter::new(store.clone(), config.limit, window)
                .with_lease(config.lock_lease()),
        ),
        LimiterMode::RedisLua => Arc::new(ScriptRateLimiter::new(
            store.clone(),
            config.limit,
            window,
        )),
    };

    info!(
        mode = %config.mode,
        limit = config.limit,
        window_ms = config.window_ms,
        global_limit = config.global_limit,
        whitelist = config.whitelist.len(),
        "Initialized rate limiter"
    );

    Arc::new(GlobalRateLimiter::new(
        per_key,
        Some(store),
        config.global_limit,
        window,
        config.whitelist.iter().cloned(),
    ))
}
