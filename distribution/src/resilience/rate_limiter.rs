//! Fixed-window rate limiter
//!
//! Counts requests per key inside a fixed window. Windows are created lazily
//! on first use (or once the previous one expired) and swept periodically.

use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use synopticon_core::{DistributionError, now_millis};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests_per_window: u32,
    /// Window length
    pub window: Duration,
    /// How long an expired window is kept before the sweep drops it
    pub grace: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 100,
            window: Duration::from_secs(60),
            grace: Duration::from_secs(60),
        }
    }
}

/// Outcome of an admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Requests left in the current window
    pub remaining: u32,
    /// Unix milliseconds when the window resets
    pub reset_at_ms: u64,
}

#[derive(Debug)]
struct Window {
    count: u32,
    window_start: Instant,
    reset_time: Instant,
}

/// Keyed fixed-window limiter
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Create a limiter; `name` labels log lines and metrics
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `key`
    ///
    /// Rejects with `RateLimitExceeded { remaining: 0, reset_at_ms }` once
    /// the window's budget is spent.
    pub fn check(&self, key: &str) -> Result<RateLimitDecision, DistributionError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            window_start: now,
            reset_time: now + self.config.window,
        });

        if now >= window.reset_time {
            window.count = 0;
            window.window_start = now;
            window.reset_time = now + self.config.window;
        }

        let reset_at_ms = now_millis() + (window.reset_time - now).as_millis() as u64;

        if window.count >= self.config.max_requests_per_window {
            tracing::debug!(
                limiter = %self.name,
                key,
                window_age_ms = (now - window.window_start).as_millis() as u64,
                "rate limited"
            );
            if let Some(m) = Metrics::get() {
                m.record_rate_limited(&self.name);
            }
            return Err(DistributionError::RateLimitExceeded {
                key: key.to_string(),
                remaining: 0,
                reset_at_ms,
            });
        }

        window.count += 1;
        Ok(RateLimitDecision {
            remaining: self.config.max_requests_per_window - window.count,
            reset_at_ms,
        })
    }

    /// Drop windows that expired more than `grace` ago; returns how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let grace = self.config.grace;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now <= w.reset_time + grace);
        before - windows.len()
    }

    /// Number of tracked keys
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            tracing::debug!(limiter = %limiter.name, removed, "swept expired windows");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_window: max,
                window: Duration::from_millis(window_ms),
                grace: Duration::from_millis(1000),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_split_at_budget() {
        let limiter = limiter(10, 5000);

        let handles: Vec<_> = (0..15)
            .map(|_| {
                let l = limiter.clone();
                tokio::spawn(async move { l.check("client-1") })
            })
            .collect();

        let mut ok = 0;
        let mut rejected = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(DistributionError::RateLimitExceeded { remaining, .. }) => {
                    assert_eq!(remaining, 0);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(rejected, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let limiter = limiter(3, 5000);
        assert_eq!(limiter.check("k").unwrap().remaining, 2);
        assert_eq!(limiter.check("k").unwrap().remaining, 1);
        assert_eq!(limiter.check("k").unwrap().remaining, 0);
        assert!(limiter.check("k").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_expiry() {
        let limiter = limiter(1, 5000);
        limiter.check("k").unwrap();
        assert!(limiter.check("k").is_err());

        tokio::time::advance(Duration::from_millis(5000)).await;
        assert!(limiter.check("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, 5000);
        limiter.check("a").unwrap();
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_grace() {
        let limiter = limiter(1, 5000);
        limiter.check("a").unwrap();

        tokio::time::advance(Duration::from_millis(5500)).await;
        assert_eq!(limiter.sweep(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_stops_on_cancel() {
        let limiter = limiter(1, 100);
        limiter.check("a").unwrap();

        let cancel = CancellationToken::new();
        let handle = limiter.spawn_sweeper(Duration::from_millis(500), cancel.clone());

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(limiter.tracked_keys(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
