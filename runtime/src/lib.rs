//! Synopticon Runtime: process bootstrap for the distribution layer
//!
//! Provides [`run()`] for zero-boilerplate startup, and [`RuntimeBuilder`]
//! for users who need control over the metrics address, sessions or the
//! distributor factory.
//!
//! # Quick start
//!
//! ```ignore
//! use synopticon_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     synopticon_runtime::run(|sessions| async move {
//!         tokio::spawn(async move {
//!             let _ = sessions
//!                 .distribute_to_session("lab-1", "face_detected", serde_json::json!({"faces": 1}))
//!                 .await;
//!         });
//!         Ok(())
//!     }).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use synopticon_distribution::config::{Config, LogFormat, load_sessions_file};
use synopticon_distribution::distribute::DistributorFactory;
use synopticon_distribution::metrics::Metrics;
use synopticon_distribution::metrics_server::MetricsServer;
use synopticon_distribution::session::{SessionConfig, SessionManager};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run Synopticon with default settings.
///
/// Loads configuration from environment variables, initialises tracing and
/// metrics, creates the sessions listed in `SYNOPTICON_SESSIONS_FILE`, hands
/// the [`SessionManager`] to your closure to wire up producers, then waits
/// for SIGINT/SIGTERM and tears every session down.
pub async fn run<F, Fut>(configure: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<SessionManager>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    RuntimeBuilder::new().configure(configure).await
}

/// Power-user builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .metrics_addr("127.0.0.1:9191".parse()?)
///     .session("lab-1", SessionConfig::default().with_distributor(
///         "telemetry",
///         DistributorConfig::Udp(UdpConfig::default()),
///     ))
///     .configure(|sessions| async move { Ok(()) })
///     .await
/// ```
pub struct RuntimeBuilder {
    metrics_addr: Option<SocketAddr>,
    metrics_enabled: bool,
    sessions: Vec<(String, SessionConfig)>,
    factory: Option<Arc<dyn DistributorFactory>>,
}

impl RuntimeBuilder {
    /// Create a new builder with defaults from environment variables.
    pub fn new() -> Self {
        Self {
            metrics_addr: None,
            metrics_enabled: true,
            sessions: Vec::new(),
            factory: None,
        }
    }

    /// Override the metrics/status server address.
    ///
    /// Default: loaded from `SYNOPTICON_METRICS_ADDR`, or `0.0.0.0:9090`.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Do not start the metrics/status server.
    pub fn disable_metrics_server(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    /// Create a session at startup, after those from the sessions file.
    pub fn session(mut self, id: impl Into<String>, config: SessionConfig) -> Self {
        self.sessions.push((id.into(), config));
        self
    }

    /// Build distributors with a custom factory.
    pub fn factory(mut self, factory: Arc<dyn DistributorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Start everything and run until a shutdown signal.
    ///
    /// Terminal method, blocks until shutdown.
    pub async fn configure<F, Fut>(self, configure: F) -> anyhow::Result<()>
    where
        F: FnOnce(Arc<SessionManager>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        // ── 1. Load config from env ──────────────────────────────
        let config = Config::from_env()?;

        // ── 2. Init tracing ──────────────────────────────────────
        init_tracing(&config);

        let metrics_addr = self.metrics_addr.unwrap_or(config.metrics_addr);
        info!(
            %metrics_addr,
            distribute_timeout_ms = config.distribute_timeout.as_millis() as u64,
            rate_limit = ?config.rate_limit_max,
            "Starting Synopticon"
        );

        // ── 3. Init metrics + session manager ────────────────────
        Metrics::init()?;
        let manager_config = config.session_manager_config();
        let sessions = Arc::new(match self.factory {
            Some(factory) => SessionManager::with_factory(manager_config, factory),
            None => SessionManager::new(manager_config),
        });
        sessions.start_background_tasks();

        // ── 4. Status server ─────────────────────────────────────
        let shutdown = CancellationToken::new();
        let metrics_handle = self.metrics_enabled.then(|| {
            MetricsServer::start(metrics_addr, Some(Arc::clone(&sessions)), shutdown.clone())
        });

        // ── 5. Bootstrap sessions + user wiring ──────────────────
        let started = async {
            let mut startup = Vec::new();
            if let Some(path) = &config.sessions_file {
                let from_file = load_sessions_file(path)?;
                info!(path = %path.display(), sessions = from_file.len(), "Loaded sessions file");
                startup.extend(from_file);
            }
            startup.extend(self.sessions);
            create_sessions(&sessions, startup).await?;
            configure(Arc::clone(&sessions)).await
        }
        .await;

        // ── 6. Wait, then shut down ──────────────────────────────
        if started.is_ok() {
            shutdown_signal().await;
        }
        sessions.shutdown().await;
        shutdown.cancel();
        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }

        match started {
            Ok(()) => {
                info!("Synopticon shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Startup failed, stopped every session");
                Err(e)
            }
        }
    }
}

/// Create startup sessions in order, tearing down the ones already created
/// if any of them fails.
async fn create_sessions(
    sessions: &SessionManager,
    startup: Vec<(String, SessionConfig)>,
) -> anyhow::Result<()> {
    for (id, session) in startup {
        if let Err(e) = sessions.create_session(&id, session).await {
            sessions.shutdown().await;
            return Err(anyhow::Error::new(e).context(format!("creating session '{id}'")));
        }
    }
    Ok(())
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // try_init: a subscriber may already be installed by the embedding process
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
