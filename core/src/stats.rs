//! Distributor statistics and health model

use crate::capabilities::Protocol;
use crate::delivery::DeliveryResult;
use crate::event::now_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Smoothing factor for the response-time moving average
const EMA_ALPHA: f64 = 0.1;

/// Last known health of a distributor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Reachable and delivering
    Healthy,
    /// Probes or deliveries are failing
    Unhealthy,
    /// Not connected (never connected, or cleaned up)
    Disconnected,
    /// No signal yet
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Label used in logs, metrics and JSON
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Disconnected => "disconnected",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Counters kept by every distributor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorStats {
    /// Target deliveries that succeeded
    pub messages_sent: u64,
    /// Target deliveries that failed
    pub messages_failed: u64,
    /// Bytes put on the wire
    pub bytes_transmitted: u64,
    /// Exponential moving average of call duration
    pub average_response_time_ms: f64,
    /// Unix milliseconds of the last send/broadcast
    pub last_request_time: Option<u64>,
    /// Last known health
    pub health_status: HealthStatus,
}

/// Uniform status shape reported by every adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorStatus {
    /// Wire protocol
    pub protocol: Protocol,
    /// Connected and not stopped
    pub active: bool,
    /// Counters
    pub stats: DistributorStats,
    /// Last known health
    pub health: HealthStatus,
    /// Adapter-specific details (connection counts, targets, flags)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// Thread-safe stats accumulator shared by the adapters
#[derive(Debug, Default)]
pub struct StatsRecorder {
    inner: Mutex<DistributorStats>,
}

impl StatsRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a delivery result into the counters
    pub fn record_delivery(&self, result: &DeliveryResult, elapsed_ms: f64) {
        let mut stats = self.inner.lock();
        stats.messages_sent += result.delivered as u64;
        stats.messages_failed += result.errors as u64;
        stats.bytes_transmitted += result.bytes() as u64;
        stats.last_request_time = Some(now_millis());
        stats.average_response_time_ms = if stats.average_response_time_ms == 0.0 {
            elapsed_ms
        } else {
            EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * stats.average_response_time_ms
        };
    }

    /// Count a call that failed before reaching any target
    pub fn record_failure(&self) {
        let mut stats = self.inner.lock();
        stats.messages_failed += 1;
        stats.last_request_time = Some(now_millis());
    }

    /// Update the health signal
    pub fn set_health(&self, health: HealthStatus) {
        self.inner.lock().health_status = health;
    }

    /// Current health signal
    pub fn health(&self) -> HealthStatus {
        self.inner.lock().health_status
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> DistributorStats {
        self.inner.lock().clone()
    }
}
