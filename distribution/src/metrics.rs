//! Prometheus metrics for Synopticon

use crate::error::{Result, SynopticonError};
use crate::resilience::CircuitState;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram_vec,
};
use std::sync::OnceLock;
use std::time::Duration;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All Synopticon metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────────
    /// Events distributed (by protocol, outcome)
    pub events_distributed: CounterVec,

    /// Target deliveries (by protocol, outcome)
    pub target_deliveries: CounterVec,

    /// Bytes put on the wire (by protocol)
    pub bytes_transmitted: CounterVec,

    /// Delivery duration in seconds (by protocol)
    pub delivery_duration_seconds: HistogramVec,

    /// Retry attempts (by operation label)
    pub retries_total: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Resilience
    // ─────────────────────────────────────────────────────────────────────────
    /// Circuit breaker state per target (0=closed, 1=open, 2=half-open)
    pub circuit_breaker_state: GaugeVec,

    /// Requests rejected by a rate limiter (by limiter)
    pub rate_limited_total: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Connections & sessions
    // ─────────────────────────────────────────────────────────────────────────
    /// Open client connections (by protocol)
    pub active_connections: GaugeVec,

    /// Distributor health (1 = healthy, 0 = otherwise)
    pub distributor_health: GaugeVec,

    /// Live sessions
    pub active_sessions: Gauge,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            events_distributed: register_counter_vec!(
                "synopticon_events_distributed_total",
                "Events handed to a distributor",
                &["protocol", "outcome"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("events_distributed: {e}")))?,

            target_deliveries: register_counter_vec!(
                "synopticon_target_deliveries_total",
                "Per-target delivery attempts",
                &["protocol", "outcome"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("target_deliveries: {e}")))?,

            bytes_transmitted: register_counter_vec!(
                "synopticon_bytes_transmitted_total",
                "Bytes put on the wire",
                &["protocol"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("bytes_transmitted: {e}")))?,

            delivery_duration_seconds: register_histogram_vec!(
                "synopticon_delivery_duration_seconds",
                "Time spent delivering one event through a distributor",
                &["protocol"],
                // Buckets: 100us to 10s
                vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0
                ]
            )
            .map_err(|e| SynopticonError::Metrics(format!("delivery_duration_seconds: {e}")))?,

            retries_total: register_counter_vec!(
                "synopticon_retries_total",
                "Retry attempts after a recoverable failure",
                &["operation"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("retries_total: {e}")))?,

            circuit_breaker_state: register_gauge_vec!(
                "synopticon_circuit_breaker_state",
                "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
                &["target"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("circuit_breaker_state: {e}")))?,

            rate_limited_total: register_counter_vec!(
                "synopticon_rate_limited_total",
                "Requests rejected by a rate limiter",
                &["limiter"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("rate_limited_total: {e}")))?,

            active_connections: register_gauge_vec!(
                "synopticon_active_connections",
                "Open WebSocket/SSE client connections",
                &["protocol", "distributor"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("active_connections: {e}")))?,

            distributor_health: register_gauge_vec!(
                "synopticon_distributor_health",
                "Distributor health (1 = healthy, 0 = otherwise)",
                &["session", "distributor"]
            )
            .map_err(|e| SynopticonError::Metrics(format!("distributor_health: {e}")))?,

            active_sessions: register_gauge!("synopticon_active_sessions", "Live sessions")
                .map_err(|e| SynopticonError::Metrics(format!("active_sessions: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| SynopticonError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record one distributor call and its per-target breakdown
    pub fn record_delivery(
        &self,
        protocol: &str,
        success: bool,
        delivered: usize,
        failed: usize,
        bytes: usize,
        duration: Duration,
    ) {
        let outcome = if success { "success" } else { "failure" };
        self.events_distributed
            .with_label_values(&[protocol, outcome])
            .inc();
        if delivered > 0 {
            self.target_deliveries
                .with_label_values(&[protocol, "success"])
                .inc_by(delivered as f64);
        }
        if failed > 0 {
            self.target_deliveries
                .with_label_values(&[protocol, "failure"])
                .inc_by(failed as f64);
        }
        self.bytes_transmitted
            .with_label_values(&[protocol])
            .inc_by(bytes as f64);
        self.delivery_duration_seconds
            .with_label_values(&[protocol])
            .observe(duration.as_secs_f64());
    }

    /// Record a retry attempt
    pub fn record_retry(&self, operation: &str) {
        self.retries_total.with_label_values(&[operation]).inc();
    }

    /// Set circuit breaker state for a target
    pub fn set_circuit_state(&self, target: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[target])
            .set(state.as_metric_value());
    }

    /// Record a rate-limited request
    pub fn record_rate_limited(&self, limiter: &str) {
        self.rate_limited_total.with_label_values(&[limiter]).inc();
    }

    /// Update open connection count
    pub fn set_active_connections(&self, protocol: &str, distributor: &str, count: usize) {
        self.active_connections
            .with_label_values(&[protocol, distributor])
            .set(count as f64);
    }

    /// Set distributor health
    pub fn set_distributor_health(&self, session: &str, distributor: &str, healthy: bool) {
        self.distributor_health
            .with_label_values(&[session, distributor])
            .set(if healthy { 1.0 } else { 0.0 });
    }

    /// Update live session count
    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as f64);
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Record a distributor call if metrics are initialized
pub fn try_record_delivery(
    protocol: &str,
    result: &synopticon_core::DeliveryResult,
    duration: Duration,
) {
    if let Some(m) = Metrics::get() {
        m.record_delivery(
            protocol,
            result.success,
            result.delivered,
            result.errors,
            result.bytes(),
            duration,
        );
    }
}

/// Update the connection gauge if metrics are initialized
pub fn try_set_active_connections(protocol: &str, distributor: &str, count: usize) {
    if let Some(m) = Metrics::get() {
        m.set_active_connections(protocol, distributor, count);
    }
}
