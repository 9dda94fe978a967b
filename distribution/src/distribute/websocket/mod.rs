//! WebSocket distributor
//!
//! Runs its own axum server. Each upgraded socket becomes a
//! [`ClientConnection`] in the distributor's [`ConnectionRegistry`]; a writer
//! task per socket drains the connection's channel so `send` never awaits a
//! slow client.

mod handler;
mod heartbeat;

use super::config::WebSocketConfig;
use super::connections::{ClientConnection, ConnectionRegistry};
use super::server::ServerHandle;
use crate::metrics;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use synopticon_core::{
    Capabilities, DeliveryResult, DistributionError, DistributionEvent, Distributor,
    DistributorStats, DistributorStatus, HealthStatus, LifecycleCell, LifecycleState, Protocol,
    SendOptions, StatsRecorder, TargetResult,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Close code sent to clients when the distributor shuts down
const GOING_AWAY: u16 = 1001;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared between the distributor and its connection tasks
pub(crate) struct WsShared {
    lifecycle: LifecycleCell,
    config: WebSocketConfig,
    registry: ConnectionRegistry<Message>,
    stats: StatsRecorder,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WsShared {
    fn at_capacity(&self) -> bool {
        self.config
            .max_connections
            .is_some_and(|max| self.registry.len() >= max)
    }

    fn status(&self) -> DistributorStatus {
        let stats = self.stats.snapshot();
        DistributorStatus {
            protocol: Protocol::WebSocket,
            active: self.lifecycle.is_active(),
            health: stats.health_status,
            stats,
            details: json!({
                "connections": self.registry.len(),
                "subscriptions": self.registry.subscribed_events(),
                "clients": self.registry.summaries(),
                "path": self.config.path,
                "localAddr": self.local_addr.lock().map(|a| a.to_string()),
            }),
        }
    }

    /// Frame an envelope per target and push it
    fn deliver(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
        targets: &[Arc<ClientConnection<Message>>],
    ) -> DeliveryResult {
        let envelope = event.envelope(Protocol::WebSocket.as_str(), options);
        self.registry.deliver(targets, |conn| {
            let text = serde_json::to_string(&envelope.clone().with_client_id(&conn.id)).ok()?;
            let len = text.len();
            Some((Message::Text(text.into()), len))
        })
    }
}

/// WebSocket distributor
pub struct WebSocketDistributor {
    shared: Arc<WsShared>,
    server: Mutex<Option<ServerHandle>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketDistributor {
    /// Build the distributor; the server is started by `connect()`
    pub fn new(name: impl Into<String>, config: WebSocketConfig) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(WsShared {
                registry: ConnectionRegistry::new(Protocol::WebSocket, name.as_str()),
                lifecycle: LifecycleCell::new(name),
                config,
                stats: StatsRecorder::new(),
                cancel: CancellationToken::new(),
                local_addr: Mutex::new(None),
            }),
            server: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    /// Bound address once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Close every client, stop the heartbeat and the server
    pub async fn disconnect(&self) {
        if !self.shared.lifecycle.stop() {
            return;
        }

        let clients = self.shared.registry.drain();
        for conn in &clients {
            conn.send(Message::Close(Some(CloseFrame {
                code: GOING_AWAY,
                reason: "server shutting down".into(),
            })));
        }
        drop(clients);
        self.shared.cancel.cancel();

        let heartbeat = self.heartbeat.lock().take();
        if let Some(task) = heartbeat {
            let _ = task.await;
        }
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop(SHUTDOWN_GRACE).await;
        }

        *self.shared.local_addr.lock() = None;
        self.shared.stats.set_health(HealthStatus::Disconnected);
        tracing::info!(distributor = %self.name(), "websocket distributor stopped");
    }

    fn finish(&self, result: &DeliveryResult, started: Instant) {
        let elapsed = started.elapsed();
        if result.targeted == 0 {
            return;
        }
        self.shared
            .stats
            .record_delivery(result, elapsed.as_secs_f64() * 1000.0);
        metrics::try_record_delivery(Protocol::WebSocket.as_str(), result, elapsed);
    }
}

#[async_trait]
impl Distributor for WebSocketDistributor {
    fn name(&self) -> &str {
        self.shared.lifecycle.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEND
            | Capabilities::BROADCAST
            | Capabilities::SUBSCRIBE
            | Capabilities::REAL_TIME
    }

    fn state(&self) -> LifecycleState {
        self.shared.lifecycle.get()
    }

    async fn connect(&self) -> Result<(), DistributionError> {
        self.shared.lifecycle.begin_connect()?;
        let config = &self.shared.config;

        let router = handler::router(Arc::clone(&self.shared));
        let server = match ServerHandle::spawn(
            self.name(),
            &config.host,
            config.port,
            router,
            self.shared.cancel.clone(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                self.shared.lifecycle.mark_error();
                self.shared.stats.set_health(HealthStatus::Unhealthy);
                return Err(e);
            }
        };

        *self.shared.local_addr.lock() = Some(server.addr);
        *self.server.lock() = Some(server);
        *self.heartbeat.lock() = Some(heartbeat::spawn(
            Arc::clone(&self.shared),
            config.heartbeat_interval,
        ));

        self.shared.lifecycle.mark_active();
        self.shared.stats.set_health(HealthStatus::Healthy);
        Ok(())
    }

    async fn send(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.shared.lifecycle.ensure_sendable()?;
        let started = Instant::now();

        let targets = self
            .shared
            .registry
            .select_targets(&event.event, options.client_id.as_deref());
        if targets.is_empty() {
            if let Some(client_id) = &options.client_id {
                let result =
                    DeliveryResult::from_targets(vec![TargetResult::failed(client_id, 0, "unknown client")]);
                self.finish(&result, started);
                return Ok(result);
            }
            tracing::trace!(distributor = %self.name(), event = %event.event, "no websocket clients");
            return Ok(DeliveryResult::empty());
        }

        let result = self.shared.deliver(event, options, &targets);
        self.finish(&result, started);
        Ok(result)
    }

    async fn broadcast(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.shared.lifecycle.ensure_sendable()?;
        let started = Instant::now();
        let targets = self.shared.registry.all();
        if targets.is_empty() {
            return Ok(DeliveryResult::empty());
        }
        let result = self.shared.deliver(event, options, &targets);
        self.finish(&result, started);
        Ok(result)
    }

    async fn health(&self) -> HealthStatus {
        if !self.shared.lifecycle.is_active() {
            return HealthStatus::Disconnected;
        }
        self.shared.stats.health()
    }

    fn stats(&self) -> DistributorStats {
        self.shared.stats.snapshot()
    }

    fn status(&self) -> DistributorStatus {
        self.shared.status()
    }

    async fn cleanup(&self) -> Result<(), DistributionError> {
        self.disconnect().await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn local() -> WebSocketConfig {
        WebSocketConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let d = WebSocketDistributor::new("ws", local());
        let event = DistributionEvent::new("s", "e", json!({}));
        assert!(matches!(
            d.send(&event, &SendOptions::default()).await,
            Err(DistributionError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_binds_ephemeral_port() {
        let d = WebSocketDistributor::new("ws", local());
        d.connect().await.unwrap();
        let addr = d.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(d.health().await, HealthStatus::Healthy);

        let status = d.status();
        assert_eq!(status.protocol, Protocol::WebSocket);
        assert_eq!(status.details["connections"], 0);
        assert_eq!(status.details["path"], "/ws");

        d.cleanup().await.unwrap();
        assert_eq!(d.state(), LifecycleState::Stopped);
        assert!(d.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_no_clients_gives_empty_result() {
        let d = WebSocketDistributor::new("ws", local());
        d.connect().await.unwrap();
        let event = DistributionEvent::new("s", "e", json!({}));
        let result = d.send(&event, &SendOptions::default()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.targeted, 0);

        let unknown = d.send(&event, &SendOptions::client("ws_nobody")).await.unwrap();
        assert!(!unknown.success);
        assert_eq!(unknown.errors, 1);
        d.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use_marks_error() {
        let first = WebSocketDistributor::new("a", local());
        first.connect().await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let second = WebSocketDistributor::new(
            "b",
            WebSocketConfig {
                port: taken,
                ..local()
            },
        );
        assert!(matches!(
            second.connect().await,
            Err(DistributionError::Connection(_))
        ));
        assert_eq!(second.state(), LifecycleState::Error);
        first.cleanup().await.unwrap();
    }
}
