//! Error types for distributors

use std::time::Duration;
use thiserror::Error;

/// Whether a failed operation is worth retrying
///
/// Attached at the point of failure so the retry layer never has to inspect
/// error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient: timeouts, unreachable peers, 5xx, overload
    Recoverable,
    /// Permanent for this attempt: validation, 4xx, quota, open circuit
    NonRecoverable,
}

/// Error type for distribution operations
///
/// Per-target and per-distributor failures are normally reported as data
/// inside a [`DeliveryResult`](crate::DeliveryResult). This type is returned
/// only when no delivery could be attempted at all, or from inside the
/// resilience layer before results are aggregated.
///
/// # Example
///
/// ```
/// use synopticon_core::{DistributionError, ErrorKind};
///
/// let err = DistributionError::Http { status: 503, message: "busy".into() };
/// assert_eq!(err.kind(), ErrorKind::Recoverable);
///
/// let err = DistributionError::Http { status: 404, message: "missing".into() };
/// assert!(!err.is_recoverable());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    /// Cannot reach the peer
    ///
    /// Examples: connection refused, DNS lookup failed, socket closed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Deadline exceeded
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Malformed payload or configuration
    #[error("validation failed: {0}")]
    Validation(String),

    /// Serialized payload exceeds the transport limit (checked before sending)
    #[error("payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Serialized size in bytes
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Too many requests for the current window
    #[error("rate limit exceeded for '{key}' (remaining {remaining}, resets at {reset_at_ms})")]
    RateLimitExceeded {
        /// Rate limit key (session, endpoint or client id)
        key: String,
        /// Requests left in the window, always 0 when rejected
        remaining: u32,
        /// Unix milliseconds when the window resets
        reset_at_ms: u64,
    },

    /// Call short-circuited by an open circuit breaker, not attempted
    #[error("circuit open for '{target}'")]
    CircuitOpen {
        /// Breaker target id
        target: String,
        /// Time left until a trial call is allowed
        retry_after: Duration,
    },

    /// `connect()` called twice without an intervening `cleanup()`
    #[error("distributor '{0}' is already active")]
    AlreadyActive(String),

    /// Session id already taken
    #[error("session '{0}' already exists")]
    SessionExists(String),

    /// Session id unknown
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Distributor is not connected (never connected, or stopped)
    #[error("distributor '{0}' is not connected")]
    NotConnected(String),

    /// Peer answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Envelope could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Peer signalled transient overload
    #[error("peer overloaded: {0}")]
    Overloaded(String),
}

impl DistributionError {
    /// Classify this error for retry purposes
    pub fn kind(&self) -> ErrorKind {
        match self {
            DistributionError::Connection(_)
            | DistributionError::Timeout(_)
            | DistributionError::Overloaded(_) => ErrorKind::Recoverable,
            DistributionError::Http { status, .. } if *status >= 500 => ErrorKind::Recoverable,
            _ => ErrorKind::NonRecoverable,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Recoverable`
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Recoverable
    }

    /// Short machine-readable code, used as a metric label and in status output
    pub fn code(&self) -> &'static str {
        match self {
            DistributionError::Connection(_) => "connection",
            DistributionError::Timeout(_) => "timeout",
            DistributionError::Validation(_) => "validation",
            DistributionError::PayloadTooLarge { .. } => "payload_too_large",
            DistributionError::RateLimitExceeded { .. } => "rate_limited",
            DistributionError::CircuitOpen { .. } => "circuit_open",
            DistributionError::AlreadyActive(_) => "already_active",
            DistributionError::SessionExists(_) => "session_exists",
            DistributionError::SessionNotFound(_) => "session_not_found",
            DistributionError::NotConnected(_) => "not_connected",
            DistributionError::Http { .. } => "http",
            DistributionError::Serialization(_) => "serialization",
            DistributionError::Overloaded(_) => "overloaded",
        }
    }
}

impl From<serde_json::Error> for DistributionError {
    fn from(err: serde_json::Error) -> Self {
        DistributionError::Serialization(err.to_string())
    }
}
