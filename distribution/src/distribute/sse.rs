//! Server-Sent Events distributor
//!
//! `GET <path>` opens a `text/event-stream`. Clients subscribe either with
//! `?events=a,b` on connect or later through `POST <path>/subscribe` and
//! `POST <path>/unsubscribe`. A stream dropped by the client removes its
//! connection through [`ClientStream`]'s drop guard.

use super::config::SseConfig;
use super::connections::{ClientConnection, ConnectionRegistry};
use super::server::ServerHandle;
use crate::metrics;
use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use synopticon_core::{
    Capabilities, DeliveryResult, DistributionError, DistributionEvent, Distributor,
    DistributorStats, DistributorStatus, HealthStatus, LifecycleCell, LifecycleState, Protocol,
    SendOptions, StatsRecorder, TargetResult, now_millis,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One queued `event:`/`data:` pair
#[derive(Debug, Clone)]
pub struct SseFrame {
    event: String,
    data: String,
}

impl SseFrame {
    fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    fn into_event(self) -> Event {
        Event::default().event(self.event).data(self.data)
    }
}

/// An `event:` field is one line; CR or LF would split the frame
fn check_event_name(name: &str) -> Result<(), DistributionError> {
    if name.contains(['\r', '\n']) {
        return Err(DistributionError::Validation(format!(
            "event name {name:?} contains a line break"
        )));
    }
    Ok(())
}

struct SseShared {
    lifecycle: LifecycleCell,
    config: SseConfig,
    registry: ConnectionRegistry<SseFrame>,
    stats: StatsRecorder,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SseShared {
    fn status(&self) -> DistributorStatus {
        let stats = self.stats.snapshot();
        DistributorStatus {
            protocol: Protocol::Sse,
            active: self.lifecycle.is_active(),
            health: stats.health_status,
            stats,
            details: json!({
                "connections": self.registry.len(),
                "maxConnections": self.config.max_connections,
                "subscriptions": self.registry.subscribed_events(),
                "clients": self.registry.summaries(),
                "path": self.config.path,
                "localAddr": self.local_addr.lock().map(|a| a.to_string()),
            }),
        }
    }
}

/// Event stream for one client; unregisters the client when dropped
struct ClientStream {
    inner: ReceiverStream<SseFrame>,
    shared: Arc<SseShared>,
    client_id: String,
}

impl Stream for ClientStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|frame| frame.map(|f| Ok(f.into_event())))
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.shared.registry.remove(&self.client_id).is_some() {
            tracing::info!(
                distributor = %self.shared.lifecycle.name(),
                client_id = %self.client_id,
                "sse client disconnected"
            );
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    events: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest {
    client_id: String,
    event: String,
}

fn router(shared: Arc<SseShared>) -> Result<Router, DistributionError> {
    let path = shared.config.path.trim_end_matches('/').to_string();
    let cors = cors_layer(&shared.config.cors_origins)?;
    Ok(Router::new()
        .route(&shared.config.path, get(open_stream))
        .route(&format!("{path}/subscribe"), post(subscribe))
        .route(&format!("{path}/unsubscribe"), post(unsubscribe))
        .route("/health", get(health))
        .layer(cors)
        .with_state(shared))
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer, DistributionError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o)
                .map_err(|_| DistributionError::Validation(format!("invalid CORS origin '{o}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

async fn open_stream(
    State(shared): State<Arc<SseShared>>,
    Query(params): Query<StreamParams>,
) -> Response {
    if !shared.lifecycle.is_active() {
        return (StatusCode::SERVICE_UNAVAILABLE, "distributor not active").into_response();
    }

    let client_id = format!("sse_{}", ulid::Ulid::new());
    let (tx, rx) = tokio::sync::mpsc::channel(shared.config.channel_capacity.max(1));
    let conn = Arc::new(ClientConnection::new(client_id.clone(), tx));
    if !shared
        .registry
        .try_insert(Arc::clone(&conn), Some(shared.config.max_connections))
    {
        tracing::warn!(
            distributor = %shared.lifecycle.name(),
            max = shared.config.max_connections,
            "sse stream rejected, at capacity"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    for event in params
        .events
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        shared.registry.subscribe(&client_id, event);
    }

    let connected = json!({ "clientId": client_id, "subscriptions": conn.subscriptions() });
    conn.send(SseFrame::new("connected", connected.to_string()));
    drop(conn);
    tracing::info!(distributor = %shared.lifecycle.name(), %client_id, "sse client connected");

    let keep_alive = KeepAlive::new()
        .interval(shared.config.keep_alive_interval.max(Duration::from_millis(1)))
        .text("keep-alive");
    let stream = ClientStream {
        inner: ReceiverStream::new(rx),
        shared,
        client_id,
    };
    Sse::new(stream).keep_alive(keep_alive).into_response()
}

async fn subscribe(
    State(shared): State<Arc<SseShared>>,
    Json(request): Json<SubscriptionRequest>,
) -> Response {
    change_subscription(&shared, request, true)
}

async fn unsubscribe(
    State(shared): State<Arc<SseShared>>,
    Json(request): Json<SubscriptionRequest>,
) -> Response {
    change_subscription(&shared, request, false)
}

fn change_subscription(shared: &SseShared, request: SubscriptionRequest, subscribe: bool) -> Response {
    if request.event.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "missing event" })),
        )
            .into_response();
    }
    let known = if subscribe {
        shared.registry.subscribe(&request.client_id, &request.event)
    } else {
        shared.registry.unsubscribe(&request.client_id, &request.event)
    };
    if !known {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "client not found" })),
        )
            .into_response();
    }
    tracing::debug!(
        client_id = %request.client_id,
        event = %request.event,
        subscribe,
        "sse subscription changed"
    );
    Json(json!({
        "success": true,
        "clientId": request.client_id,
        "event": request.event,
    }))
    .into_response()
}

async fn health(State(shared): State<Arc<SseShared>>) -> Json<Value> {
    Json(json!({
        "status": shared.stats.health(),
        "connections": shared.registry.len(),
        "timestamp": now_millis(),
    }))
}

/// SSE distributor
pub struct SseDistributor {
    shared: Arc<SseShared>,
    cancel: CancellationToken,
    server: Mutex<Option<ServerHandle>>,
}

impl SseDistributor {
    /// Build the distributor; the server is started by `connect()`
    pub fn new(name: impl Into<String>, config: SseConfig) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(SseShared {
                registry: ConnectionRegistry::new(Protocol::Sse, name.as_str()),
                lifecycle: LifecycleCell::new(name),
                config,
                stats: StatsRecorder::new(),
                local_addr: Mutex::new(None),
            }),
            cancel: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    /// Bound address once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Open streams
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    fn deliver(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
        targets: &[Arc<ClientConnection<SseFrame>>],
    ) -> Result<DeliveryResult, DistributionError> {
        let started = Instant::now();
        if let Err(e) = check_event_name(&event.event) {
            self.shared.stats.record_failure();
            return Err(e);
        }
        let data = serde_json::to_string(&event.envelope(Protocol::Sse.as_str(), options))?;
        let len = data.len();
        let result = self.shared.registry.deliver(targets, |_| {
            Some((SseFrame::new(event.event.as_str(), data.as_str()), len))
        });
        self.record(&result, started);
        Ok(result)
    }

    fn record(&self, result: &DeliveryResult, started: Instant) {
        let elapsed = started.elapsed();
        self.shared
            .stats
            .record_delivery(result, elapsed.as_secs_f64() * 1000.0);
        metrics::try_record_delivery(Protocol::Sse.as_str(), result, elapsed);
    }
}

#[async_trait]
impl Distributor for SseDistributor {
    fn name(&self) -> &str {
        self.shared.lifecycle.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Sse
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

        let served = match router(Arc::clone(&self.shared)) {
            Ok(router) => {
                ServerHandle::spawn(
                    self.name(),
                    &config.host,
                    config.port,
                    router,
                    self.cancel.clone(),
                )
                .await
            }
            Err(e) => Err(e),
        };
        let server = match served {
            Ok(server) => server,
            Err(e) => {
                self.shared.lifecycle.mark_error();
                self.shared.stats.set_health(HealthStatus::Unhealthy);
                return Err(e);
            }
        };

        *self.shared.local_addr.lock() = Some(server.addr);
        *self.server.lock() = Some(server);
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
        let targets = self
            .shared
            .registry
            .select_targets(&event.event, options.client_id.as_deref());
        if targets.is_empty() {
            if let Some(client_id) = &options.client_id {
                let result =
                    DeliveryResult::from_targets(vec![TargetResult::failed(client_id, 0, "unknown client")]);
                self.record(&result, Instant::now());
                return Ok(result);
            }
            return Ok(DeliveryResult::empty());
        }
        self.deliver(event, options, &targets)
    }

    async fn broadcast(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.shared.lifecycle.ensure_sendable()?;
        let targets = self.shared.registry.all();
        if targets.is_empty() {
            return Ok(DeliveryResult::empty());
        }
        self.deliver(event, options, &targets)
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
        if !self.shared.lifecycle.stop() {
            return Ok(());
        }
        // Dropping the senders ends every open stream
        let closed = self.shared.registry.drain().len();
        self.cancel.cancel();
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop(SHUTDOWN_GRACE).await;
        }
        *self.shared.local_addr.lock() = None;
        self.shared.stats.set_health(HealthStatus::Disconnected);
        tracing::info!(distributor = %self.name(), closed, "sse distributor stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn shared() -> Arc<SseShared> {
        let shared = Arc::new(SseShared {
            lifecycle: LifecycleCell::new("sse"),
            config: SseConfig::default(),
            registry: ConnectionRegistry::new(Protocol::Sse, "sse"),
            stats: StatsRecorder::new(),
            local_addr: Mutex::new(None),
        });
        shared.lifecycle.begin_connect().unwrap();
        shared.lifecycle.mark_active();
        shared
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_event_name_line_breaks_rejected() {
        assert!(check_event_name("emotion.update").is_ok());
        assert!(check_event_name("a\nb").is_err());
        assert!(check_event_name("a\rb").is_err());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_client_is_404() {
        let app = router(shared()).unwrap();
        let response = app
            .oneshot(post_json(
                "/events/subscribe",
                json!({ "clientId": "sse_nobody", "event": "face_detected" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_subscribe_known_client() {
        let shared = shared();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        shared
            .registry
            .try_insert(Arc::new(ClientConnection::new("sse_1", tx)), None);

        let app = router(Arc::clone(&shared)).unwrap();
        let response = app
            .clone()
            .oneshot(post_json(
                "/events/subscribe",
                json!({ "clientId": "sse_1", "event": "face_detected" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(shared.registry.subscriber_count("face_detected"), 1);

        let response = app
            .oneshot(post_json(
                "/events/unsubscribe",
                json!({ "clientId": "sse_1", "event": "face_detected" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(shared.registry.subscriber_count("face_detected"), 0);
    }

    #[tokio::test]
    async fn test_stream_over_capacity_is_503() {
        let shared = Arc::new(SseShared {
            config: SseConfig {
                max_connections: 1,
                ..Default::default()
            },
            ..Arc::into_inner(shared()).unwrap()
        });
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        shared
            .registry
            .try_insert(Arc::new(ClientConnection::new("sse_1", tx)), None);

        let response = router(shared)
            .unwrap()
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dropping_stream_unregisters_client() {
        let shared = shared();
        let response = router(Arc::clone(&shared))
            .unwrap()
            .oneshot(
                Request::get("/events?events=a,b")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
        assert_eq!(shared.registry.len(), 1);
        assert_eq!(shared.registry.subscribed_events(), vec!["a", "b"]);

        drop(response);
        assert!(shared.registry.is_empty());
        assert!(shared.registry.subscribed_events().is_empty());
    }

    #[tokio::test]
    async fn test_preflight_is_answered() {
        let response = router(shared())
            .unwrap()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/events")
                    .header("origin", "http://dashboard.local")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[test]
    fn test_invalid_cors_origin_rejected() {
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
        assert!(cors_layer(&["http://ok.local".to_string()]).is_ok());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let d = SseDistributor::new("sse", SseConfig::default());
        let event = DistributionEvent::new("s", "e", json!({}));
        assert!(matches!(
            d.send(&event, &SendOptions::default()).await,
            Err(DistributionError::NotConnected(_))
        ));
    }
}
