//! UDP datagram distributor
//!
//! Every event goes to every target as one datagram holding the JSON
//! envelope, optionally gzip-compressed. Oversized envelopes are rejected
//! before anything is sent.

use super::config::{UdpConfig, UdpTarget};
use crate::metrics;
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::json;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use synopticon_core::{
    Capabilities, DeliveryResult, DistributionError, DistributionEvent, Distributor,
    DistributorStats, DistributorStatus, HealthStatus, LifecycleCell, LifecycleState, Protocol,
    SendOptions, StatsRecorder, TargetResult,
};
use tokio::net::UdpSocket;

/// UDP distributor
pub struct UdpDistributor {
    lifecycle: LifecycleCell,
    config: UdpConfig,
    targets: RwLock<Vec<UdpTarget>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    stats: StatsRecorder,
}

impl UdpDistributor {
    /// Build the distributor; the socket is bound by `connect()`
    pub fn new(name: impl Into<String>, config: UdpConfig) -> Self {
        let targets = config.targets.clone();
        Self {
            lifecycle: LifecycleCell::new(name),
            config,
            targets: RwLock::new(targets),
            socket: RwLock::new(None),
            stats: StatsRecorder::new(),
        }
    }

    /// Add a peer; false if it is already present
    pub fn add_target(&self, target: UdpTarget) -> bool {
        let mut targets = self.targets.write();
        if targets.contains(&target) {
            return false;
        }
        tracing::info!(distributor = %self.name(), target = %target.addr(), "udp target added");
        targets.push(target);
        true
    }

    /// Remove a peer; false if it was not present
    pub fn remove_target(&self, target: &UdpTarget) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t != target);
        let removed = targets.len() != before;
        if removed {
            tracing::info!(distributor = %self.name(), target = %target.addr(), "udp target removed");
        }
        removed
    }

    /// Current peers
    pub fn targets(&self) -> Vec<UdpTarget> {
        self.targets.read().clone()
    }

    /// Address of the bound socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .read()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Serialize, size-check and optionally compress an envelope
    fn encode(&self, event: &DistributionEvent, options: &SendOptions) -> Result<Vec<u8>, DistributionError> {
        let raw = event.envelope(Protocol::Udp.as_str(), options).to_vec()?;
        if raw.len() > self.config.max_payload {
            return Err(DistributionError::PayloadTooLarge {
                size: raw.len(),
                max: self.config.max_payload,
            });
        }
        if !self.config.compress {
            return Ok(raw);
        }
        match gzip(&raw) {
            Ok(compressed) => Ok(smaller_within(raw, compressed, self.config.max_payload)),
            Err(e) => {
                tracing::warn!(distributor = %self.name(), error = %e, "gzip failed, sending raw");
                Ok(raw)
            }
        }
    }
}

/// Compressed bytes when they fit under `max`, otherwise the raw envelope
fn smaller_within(raw: Vec<u8>, compressed: Vec<u8>, max: usize) -> Vec<u8> {
    if compressed.len() <= max {
        return compressed;
    }
    tracing::debug!(
        compressed = compressed.len(),
        max,
        "compressed datagram over the limit, sending raw"
    );
    raw
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

async fn send_to(socket: &UdpSocket, payload: &[u8], target: &UdpTarget) -> TargetResult {
    let addr = target.addr();
    let started = Instant::now();
    let outcome = socket.send_to(payload, addr.as_str()).await;
    let elapsed = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(sent) => TargetResult::ok(addr, elapsed, sent),
        Err(e) => TargetResult::failed(addr, elapsed, DistributionError::Connection(e.to_string())),
    }
}

#[async_trait]
impl Distributor for UdpDistributor {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEND | Capabilities::BROADCAST | Capabilities::REAL_TIME
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    async fn connect(&self) -> Result<(), DistributionError> {
        self.lifecycle.begin_connect()?;
        match UdpSocket::bind(&self.config.bind_addr).await {
            Ok(socket) => {
                let local = socket.local_addr().ok();
                *self.socket.write() = Some(Arc::new(socket));
                self.lifecycle.mark_active();
                self.stats.set_health(HealthStatus::Healthy);
                tracing::info!(
                    distributor = %self.name(),
                    local_addr = ?local,
                    targets = self.targets.read().len(),
                    "udp distributor bound"
                );
                Ok(())
            }
            Err(e) => {
                self.lifecycle.mark_error();
                self.stats.set_health(HealthStatus::Unhealthy);
                Err(DistributionError::Connection(format!(
                    "bind {}: {e}",
                    self.config.bind_addr
                )))
            }
        }
    }

    async fn send(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.lifecycle.ensure_sendable()?;
        let socket = self
            .socket
            .read()
            .clone()
            .ok_or_else(|| DistributionError::NotConnected(self.name().to_string()))?;

        let payload = match self.encode(event, options) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        let targets = self.targets();
        if targets.is_empty() {
            return Ok(DeliveryResult::empty());
        }

        let started = Instant::now();
        let per_target = join_all(
            targets
                .iter()
                .map(|target| send_to(&socket, &payload, target)),
        )
        .await;
        let result = DeliveryResult::from_targets(per_target);

        let elapsed = started.elapsed();
        self.stats
            .record_delivery(&result, elapsed.as_secs_f64() * 1000.0);
        metrics::try_record_delivery(Protocol::Udp.as_str(), &result, elapsed);
        if result.success {
            self.stats.set_health(HealthStatus::Healthy);
        } else {
            tracing::warn!(
                distributor = %self.name(),
                error = result.first_error().unwrap_or("unknown"),
                "udp delivery failed for every target"
            );
            self.stats.set_health(HealthStatus::Unhealthy);
        }
        Ok(result)
    }

    async fn health(&self) -> HealthStatus {
        if !self.lifecycle.is_active() || self.socket.read().is_none() {
            return HealthStatus::Disconnected;
        }
        self.stats.health()
    }

    fn stats(&self) -> DistributorStats {
        self.stats.snapshot()
    }

    fn status(&self) -> DistributorStatus {
        let stats = self.stats.snapshot();
        let targets: Vec<String> = self.targets.read().iter().map(UdpTarget::addr).collect();
        DistributorStatus {
            protocol: Protocol::Udp,
            active: self.lifecycle.is_active(),
            health: stats.health_status,
            stats,
            details: json!({
                "targets": targets,
                "compress": self.config.compress,
                "maxPayload": self.config.max_payload,
                "localAddr": self.local_addr().map(|a| a.to_string()),
            }),
        }
    }

    async fn cleanup(&self) -> Result<(), DistributionError> {
        self.socket.write().take();
        if self.lifecycle.stop() {
            self.stats.set_health(HealthStatus::Disconnected);
            tracing::info!(distributor = %self.name(), "udp distributor stopped");
        }
        Ok(())
    }
}
