//! Error types for Synopticon

use thiserror::Error;

// Re-export the distributor error from synopticon-core
pub use synopticon_core::{DistributionError, ErrorKind};

/// Result type alias for Synopticon operations
pub type Result<T> = std::result::Result<T, SynopticonError>;

/// Main error type for the ambient layer (config, servers, metrics)
#[derive(Error, Debug)]
pub enum SynopticonError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Distribution error
    #[error(transparent)]
    Distribution(#[from] DistributionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl SynopticonError {
    /// HTTP status code used when this error surfaces through the status server
    pub fn status_code(&self) -> u16 {
        match self {
            SynopticonError::Config(_) | SynopticonError::Serialization(_) => 400,
            SynopticonError::Distribution(e) => match e {
                DistributionError::SessionNotFound(_) => 404,
                DistributionError::SessionExists(_) | DistributionError::AlreadyActive(_) => 409,
                DistributionError::Validation(_) | DistributionError::PayloadTooLarge { .. } => 400,
                DistributionError::RateLimitExceeded { .. } => 429,
                _ => 503,
            },
            SynopticonError::Io(_) | SynopticonError::Metrics(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_error_to_synopticon_error() {
        let err: SynopticonError = DistributionError::SessionNotFound("lab".into()).into();
        assert!(matches!(err, SynopticonError::Distribution(_)));
        assert_eq!(err.to_string(), "session 'lab' not found");
    }

    #[test]
    fn test_status_codes() {
        let err: SynopticonError = DistributionError::SessionNotFound("lab".into()).into();
        assert_eq!(err.status_code(), 404);

        let err: SynopticonError = DistributionError::RateLimitExceeded {
            key: "lab".into(),
            remaining: 0,
            reset_at_ms: 0,
        }
        .into();
        assert_eq!(err.status_code(), 429);

        assert_eq!(SynopticonError::Config("bad".into()).status_code(), 400);
    }
}
