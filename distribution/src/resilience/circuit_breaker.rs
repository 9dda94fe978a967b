//! Keyed circuit breaker
//!
//! One breaker state per target id, created lazily and kept for the life of
//! the process. While open, calls are short-circuited without invoking the
//! operation.

use crate::metrics::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use synopticon_core::DistributionError;
use tokio::time::Instant;

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow through
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call allowed
    HalfOpen,
}

impl CircuitState {
    /// Convert to Prometheus metric value (0=Closed, 1=Open, 2=HalfOpen)
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Monitoring view of one target's breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Time since the last failure
    #[serde(skip)]
    pub since_last_failure: Option<Duration>,
    /// Time until a trial call is allowed (open only)
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct TargetState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    trial_in_flight: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker registry keyed by target id
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    targets: Mutex<HashMap<String, TargetState>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` through the breaker for `target`
    ///
    /// Returns `CircuitOpen` without calling `op` when the circuit is open.
    pub async fn call<T, F, Fut>(&self, target: &str, op: F) -> Result<T, DistributionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DistributionError>>,
    {
        let permit = self.try_acquire(target)?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Admit a call or short-circuit it
    ///
    /// The returned permit reports the outcome. Dropping it unreported
    /// frees the half-open trial slot so the next call can take it.
    pub fn try_acquire(&self, target: &str) -> Result<CircuitPermit<'_>, DistributionError> {
        let mut targets = self.targets.lock();
        let entry = targets
            .entry(target.to_string())
            .or_insert_with(TargetState::new);
        let now = Instant::now();

        let trial = match entry.state {
            CircuitState::Closed => false,
            CircuitState::Open => match entry.next_attempt_time {
                Some(next) if now >= next => {
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    tracing::info!(target_id = target, "circuit breaker half-open, trial call");
                    publish(target, CircuitState::HalfOpen);
                    true
                }
                next => {
                    return Err(DistributionError::CircuitOpen {
                        target: target.to_string(),
                        retry_after: next.map(|n| n - now).unwrap_or_default(),
                    });
                }
            },
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    return Err(DistributionError::CircuitOpen {
                        target: target.to_string(),
                        retry_after: Duration::ZERO,
                    });
                }
                entry.trial_in_flight = true;
                true
            }
        };

        Ok(CircuitPermit {
            breaker: self,
            target: target.to_string(),
            trial,
            settled: false,
        })
    }

    fn record_success(&self, target: &str) {
        let mut targets = self.targets.lock();
        let entry = targets
            .entry(target.to_string())
            .or_insert_with(TargetState::new);
        let was = entry.state;
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.next_attempt_time = None;
        entry.trial_in_flight = false;
        if was != CircuitState::Closed {
            tracing::info!(target_id = target, "circuit breaker closed, target recovered");
            publish(target, CircuitState::Closed);
        }
    }

    fn record_failure(&self, target: &str) {
        let mut targets = self.targets.lock();
        let entry = targets
            .entry(target.to_string())
            .or_insert_with(TargetState::new);
        let now = Instant::now();
        entry.failure_count += 1;
        entry.last_failure_time = Some(now);
        entry.trial_in_flight = false;

        match entry.state {
            CircuitState::Closed if entry.failure_count >= self.config.failure_threshold => {
                entry.state = CircuitState::Open;
                entry.next_attempt_time = Some(now + self.config.recovery_timeout);
                tracing::warn!(
                    target_id = target,
                    failures = entry.failure_count,
                    "circuit breaker opened"
                );
                publish(target, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.next_attempt_time = Some(now + self.config.recovery_timeout);
                tracing::warn!(target_id = target, "circuit breaker re-opened, trial failed");
                publish(target, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn release_trial(&self, target: &str) {
        let mut targets = self.targets.lock();
        if let Some(entry) = targets.get_mut(target) {
            if entry.state == CircuitState::HalfOpen {
                entry.trial_in_flight = false;
                tracing::debug!(target_id = target, "half-open trial abandoned");
            }
        }
    }

    /// Current state of `target` (closed when never seen)
    pub fn state(&self, target: &str) -> CircuitState {
        self.targets
            .lock()
            .get(target)
            .map(|t| t.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Monitoring snapshot of `target`
    pub fn snapshot(&self, target: &str) -> CircuitSnapshot {
        let targets = self.targets.lock();
        let now = Instant::now();
        match targets.get(target) {
            Some(t) => CircuitSnapshot {
                state: t.state,
                failure_count: t.failure_count,
                since_last_failure: t.last_failure_time.map(|at| now - at),
                retry_after: match t.state {
                    CircuitState::Open => t.next_attempt_time.map(|n| n.saturating_duration_since(now)),
                    _ => None,
                },
            },
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                since_last_failure: None,
                retry_after: None,
            },
        }
    }
}

/// Admission to one call through the breaker
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure).
#[derive(Debug)]
#[must_use = "an unreported permit records nothing"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    target: String,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call succeeded
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(&self.target);
    }

    /// The call failed
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.target);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(&self.target);
        }
    }
}

fn publish(target: &str, state: CircuitState) {
    if let Some(m) = Metrics::get() {
        m.set_circuit_state(target, state);
    }
}
