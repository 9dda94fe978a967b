//! Resilience primitives guarding outbound calls
//!
//! - **retry_with_backoff**: exponential backoff, recoverable errors only
//! - **CircuitBreaker**: fail fast per target after repeated failures
//! - **RateLimiter**: fixed-window request budget per key
//!
//! # Example
//!
//! ```ignore
//! use synopticon_distribution::resilience::*;
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//! let result = breaker
//!     .call("lab/http", || retry_with_backoff(&RetryPolicy::default(), "post", |_| send()))
//!     .await;
//! ```

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::{RetryPolicy, retry_until_cancelled, retry_with_backoff};
