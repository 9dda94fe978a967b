//! Synopticon distribution layer
//!
//! Delivers analysis events to downstream consumers over HTTP, WebSocket,
//! Server-Sent Events and UDP, grouped into sessions.
//!
//! ```text
//!                        ┌──► HttpDistributor ──► webhooks
//! producer ──► Session ──┼──► WebSocketDistributor ──► ws clients
//!   (event, data)        ├──► SseDistributor ──► event streams
//!                        └──► UdpDistributor ──► datagram peers
//! ```
//!
//! Every distributor call inside a session goes through a per-target
//! circuit breaker; HTTP adds retry with exponential backoff and sessions may
//! be rate limited.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod distribute;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod resilience;
pub mod session;

pub use config::{Config, LogFormat};
pub use distribute::{
    DistributorConfig, DistributorFactory, HttpConfig, HttpDistributor, ProtocolFactory,
    SseConfig, SseDistributor, UdpConfig, UdpDistributor, UdpTarget, WebSocketConfig,
    WebSocketDistributor,
};
pub use error::{Result, SynopticonError};
pub use metrics_server::MetricsServer;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitConfig, RateLimiter, RetryPolicy,
    retry_with_backoff,
};
pub use session::{SessionConfig, SessionManager, SessionManagerConfig, SessionStats, SessionStatus};
