//! HTTP server for Prometheus metrics and session introspection
//!
//! Runs on its own port, separate from the WebSocket/SSE listeners.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics
//! - `GET /health` - JSON health summary
//! - `GET /sessions` - status of every session
//! - `GET /sessions/{id}` - status of one session
//!
//! # Example
//!
//! ```ignore
//! use synopticon_distribution::metrics_server::MetricsServer;
//!
//! let handle = MetricsServer::start(addr, Some(Arc::clone(&sessions)), cancel.clone());
//! ```

use crate::error::SynopticonError;
use crate::session::SessionManager;
use axum::extract::{Path, State};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use synopticon_core::HealthStatus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    sessions: Option<Arc<SessionManager>>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// The server runs until `shutdown` is cancelled or the handle is aborted.
    pub fn start(
        addr: SocketAddr,
        sessions: Option<Arc<SessionManager>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let app = router(sessions);

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "Failed to bind metrics server");
                    return;
                }
            };
            info!(%addr, "Metrics server listening");

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(sessions: Option<Arc<SessionManager>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/{id}", get(session_handler))
        .with_state(AppState { sessions })
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Health summary across every session's distributors
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthSummary {
    status: &'static str,
    sessions: usize,
    distributors: DistributorCounts,
}

#[derive(Default, Serialize)]
struct DistributorCounts {
    healthy: usize,
    unhealthy: usize,
    disconnected: usize,
    unknown: usize,
}

/// Handler for /health endpoint
///
/// `degraded` when any distributor is not healthy; the process itself is
/// still serving, so the code stays 200.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(sessions) = state.sessions else {
        return Json(serde_json::json!({ "status": "ok" })).into_response();
    };

    let statuses = sessions.all_session_statuses().await;
    let mut counts = DistributorCounts::default();
    for status in statuses.iter().flat_map(|s| s.distributors.values()) {
        match status.health {
            HealthStatus::Healthy => counts.healthy += 1,
            HealthStatus::Unhealthy => counts.unhealthy += 1,
            HealthStatus::Disconnected => counts.disconnected += 1,
            HealthStatus::Unknown => counts.unknown += 1,
        }
    }
    let status = if counts.unhealthy + counts.disconnected + counts.unknown > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthSummary {
        status,
        sessions: statuses.len(),
        distributors: counts,
    })
    .into_response()
}

/// Handler for /sessions endpoint
async fn sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.sessions {
        Some(sessions) => Json(sessions.all_session_statuses().await).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "No session manager").into_response(),
    }
}

/// Handler for /sessions/{id} endpoint
async fn session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(sessions) = state.sessions else {
        return (StatusCode::SERVICE_UNAVAILABLE, "No session manager").into_response();
    };
    match sessions.get_session_status(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            let e = SynopticonError::from(e);
            let code = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}
