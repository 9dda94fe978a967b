//! Convenience re-exports for applications embedding Synopticon.
//!
//! ```rust
//! use synopticon_runtime::prelude::*;
//! ```

// Core contract
pub use synopticon_core::{
    Capabilities, DeliveryResult, DistributionError, DistributionEvent, Distributor,
    DistributorOutcome, DistributorStats, DistributorStatus, HealthStatus, Protocol, SendOptions,
};

// Sessions
pub use synopticon_distribution::{
    SessionConfig, SessionManager, SessionManagerConfig, SessionStats, SessionStatus,
};

// Distributors and their configs
pub use synopticon_distribution::{
    DistributorConfig, DistributorFactory, HttpConfig, HttpDistributor, ProtocolFactory,
    SseConfig, SseDistributor, UdpConfig, UdpDistributor, UdpTarget, WebSocketConfig,
    WebSocketDistributor,
};

// Resilience
pub use synopticon_distribution::{
    CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, RateLimiter, RetryPolicy,
};

// Error types
pub use synopticon_distribution::SynopticonError;

// Runtime
pub use crate::RuntimeBuilder;
