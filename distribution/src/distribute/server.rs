//! Embedded axum server used by the WebSocket and SSE distributors

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use synopticon_core::DistributionError;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running listener
pub(crate) struct ServerHandle {
    pub(crate) addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bind `host:port` and serve `router` until `cancel` fires
    pub(crate) async fn spawn(
        distributor: &str,
        host: &str,
        port: u16,
        router: Router,
        cancel: CancellationToken,
    ) -> Result<Self, DistributionError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| DistributionError::Connection(format!("bind {host}:{port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DistributionError::Connection(e.to_string()))?;

        let name = distributor.to_string();
        let task = tokio::spawn(async move {
            let shutdown = cancel.cancelled_owned();
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(distributor = %name, error = %e, "server error");
            }
            tracing::debug!(distributor = %name, "server stopped");
        });

        tracing::info!(distributor, %addr, "server listening");
        Ok(Self { addr, task })
    }

    /// Wait up to `grace` for the server to drain, then abort it
    pub(crate) async fn stop(self, grace: Duration) {
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }
}
