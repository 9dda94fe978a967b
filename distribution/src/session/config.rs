//! Session and session-manager configuration

use crate::distribute::config::DistributorConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use synopticon_core::DistributionError;

/// Distributors of one session plus its routing table
///
/// ```json
/// {
///   "distributors": {
///     "dashboard": { "type": "websocket", "port": 8080 },
///     "telemetry": { "type": "udp", "targets": [{ "host": "10.0.0.5", "port": 9999 }] }
///   },
///   "eventRouting": { "face_detected": ["dashboard", "telemetry"] }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Distributor name -> adapter config
    pub distributors: BTreeMap<String, DistributorConfig>,
    /// Event name -> distributors it goes to, in delivery order
    pub event_routing: BTreeMap<String, Vec<String>>,
}

impl SessionConfig {
    /// Add a distributor
    pub fn with_distributor(mut self, name: impl Into<String>, config: DistributorConfig) -> Self {
        self.distributors.insert(name.into(), config);
        self
    }

    /// Route `event` to `distributors`
    pub fn route<I, S>(mut self, event: impl Into<String>, distributors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_routing
            .insert(event.into(), distributors.into_iter().map(Into::into).collect());
        self
    }

    /// Check that routing only names distributors of this session
    pub fn validate(&self) -> Result<(), DistributionError> {
        if let Some(name) = self.distributors.keys().find(|n| n.trim().is_empty()) {
            return Err(DistributionError::Validation(format!(
                "invalid distributor name '{name}'"
            )));
        }
        for (event, names) in &self.event_routing {
            let mut seen = BTreeSet::new();
            for name in names {
                if !self.distributors.contains_key(name) {
                    return Err(DistributionError::Validation(format!(
                        "route '{event}' references unknown distributor '{name}'"
                    )));
                }
                if !seen.insert(name) {
                    return Err(DistributionError::Validation(format!(
                        "route '{event}' lists distributor '{name}' twice"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Settings shared by every session of a manager
#[derive(Debug, Clone, PartialEq)]
pub struct SessionManagerConfig {
    /// Upper bound on one distributor's send inside a fan-out
    pub distribute_timeout: Duration,
    /// Breaker settings, one breaker entry per `<session>/<distributor>`
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-session limit on `distribute_to_session` calls
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            distribute_timeout: Duration::from_millis(5000),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
        }
    }
}
