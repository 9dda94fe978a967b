//! Retry with exponential backoff
//!
//! Wraps any async operation returning `Result<T, DistributionError>` and
//! retries it while the error is classified as recoverable.

use crate::metrics::Metrics;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use synopticon_core::DistributionError;
use tokio_util::sync::CancellationToken;

/// Lock-free xorshift64 PRNG for jitter randomness
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Random f64 in [0.0, 1.0]
    fn next_f64(&self) -> f64 {
        (self.next() as f64) / (u64::MAX as f64)
    }
}

static JITTER_RNG: std::sync::LazyLock<Xorshift64> = std::sync::LazyLock::new(Xorshift64::new);

fn rand_jitter() -> f64 {
    JITTER_RNG.next_f64()
}

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0), randomizes delay by +/- this fraction
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Doubling backoff without jitter: `base * 2^(attempt-1)`
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before attempt n (0-indexed); attempt 0 has none
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.jitter_factor == 0.0 {
            self.delay_for_attempt_with_jitter(attempt, 0.5)
        } else {
            self.delay_for_attempt_with_jitter(attempt, rand_jitter())
        }
    }

    /// Longest a full retry run can take when each attempt may use `per_attempt`
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let backoff: Duration = (1..=self.max_retries)
            .map(|attempt| self.delay_for_attempt_with_jitter(attempt, 1.0))
            .sum();
        per_attempt.saturating_mul(self.max_retries.saturating_add(1)) + backoff
    }

    /// Delay with an explicit jitter sample in [0.0, 1.0]
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_us =
            self.base_delay.as_micros() as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let max_us = self.max_delay.as_micros() as f64;
        let base_us = base_us.min(max_us);

        // jitter in [0, 1] maps to an offset in [-range, +range]
        let jitter_range = base_us * self.jitter_factor;
        let jitter_offset = (jitter * 2.0 - 1.0) * jitter_range;
        let final_us = (base_us + jitter_offset).clamp(0.0, max_us);

        Duration::from_micros(final_us as u64)
    }
}

/// Run `op` until it succeeds, fails non-recoverably, or retries run out
///
/// `label` names the operation in logs and metrics.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    op: F,
) -> Result<T, DistributionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DistributionError>>,
{
    retry_until_cancelled(policy, label, &CancellationToken::new(), op).await
}

/// [`retry_with_backoff`] whose backoff sleeps abort when `cancel` fires
///
/// A cancelled retry returns the last error seen.
pub async fn retry_until_cancelled<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, DistributionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DistributionError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = label, attempt, "recovered after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_recoverable() => {
                tracing::debug!(operation = label, attempt, error = %e, "non-recoverable failure");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_retries => {
                tracing::warn!(
                    operation = label,
                    attempts = attempt + 1,
                    error = %e,
                    "retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    operation = label,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                if let Some(m) = Metrics::get() {
                    m.record_retry(label);
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
        }
    }
}
