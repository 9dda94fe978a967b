//! Session Manager Integration Tests
//!
//! Sessions are built through a scripted factory so delivery outcomes,
//! breaker trips and config reconciliation can be observed directly. One
//! test at the end runs a real UDP distributor end to end.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use synopticon_core::{
    Capabilities, DeliveryResult, DistributionError, DistributionEvent, Distributor,
    DistributorStats, HealthStatus, LifecycleCell, LifecycleState, Protocol, SendOptions,
    StatsRecorder, TargetResult,
};
use synopticon_distribution::distribute::{
    DistributorConfig, DistributorFactory, HttpConfig, UdpConfig, UdpTarget,
};
use synopticon_distribution::resilience::{CircuitBreakerConfig, CircuitState, RateLimitConfig};
use synopticon_distribution::session::{SessionConfig, SessionManager, SessionManagerConfig};
use tokio::net::UdpSocket;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// TEST INFRASTRUCTURE
// =============================================================================

/// How a scripted distributor behaves, chosen by name prefix
#[derive(Debug, Clone, Copy, PartialEq)]
enum Script {
    Ok,
    /// Every send reports a failed target
    Fail,
    /// Sends hang far past any test deadline
    Slow,
    /// `connect()` fails, sends still succeed
    Flaky,
}

impl Script {
    fn for_name(name: &str) -> Self {
        if name.starts_with("fail") {
            Script::Fail
        } else if name.starts_with("slow") {
            Script::Slow
        } else if name.starts_with("flaky") {
            Script::Flaky
        } else {
            Script::Ok
        }
    }
}

struct ScriptedDistributor {
    lifecycle: LifecycleCell,
    script: Script,
    stats: StatsRecorder,
    received: Mutex<Vec<String>>,
    sends: AtomicUsize,
    cleaned_up: AtomicBool,
}

impl ScriptedDistributor {
    fn new(name: &str) -> Self {
        Self {
            lifecycle: LifecycleCell::new(name),
            script: Script::for_name(name),
            stats: StatsRecorder::new(),
            received: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
            cleaned_up: AtomicBool::new(false),
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl Distributor for ScriptedDistributor {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEND
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    async fn connect(&self) -> Result<(), DistributionError> {
        self.lifecycle.begin_connect()?;
        if self.script == Script::Flaky {
            self.lifecycle.mark_error();
            self.stats.set_health(HealthStatus::Unhealthy);
            return Err(DistributionError::Connection("peer refused".into()));
        }
        self.lifecycle.mark_active();
        self.stats.set_health(HealthStatus::Healthy);
        Ok(())
    }

    async fn send(
        &self,
        event: &DistributionEvent,
        _options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.lifecycle.ensure_sendable()?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        let target = match self.script {
            Script::Fail => TargetResult::failed(self.name(), 0, "peer rejected event"),
            Script::Slow => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                TargetResult::ok(self.name(), 60_000, 1)
            }
            Script::Ok | Script::Flaky => {
                self.received.lock().push(event.event.clone());
                TargetResult::ok(self.name(), 0, 1)
            }
        };
        let result = DeliveryResult::from_targets(vec![target]);
        self.stats.record_delivery(&result, 0.0);
        Ok(result)
    }

    async fn health(&self) -> HealthStatus {
        self.stats.health()
    }

    fn stats(&self) -> DistributorStats {
        self.stats.snapshot()
    }

    async fn cleanup(&self) -> Result<(), DistributionError> {
        self.cleaned_up.store(true, Ordering::SeqCst);
        self.lifecycle.stop();
        Ok(())
    }
}

/// Factory that remembers every distributor it built, by name
#[derive(Default)]
struct ScriptedFactory {
    built: Mutex<HashMap<String, Vec<Arc<ScriptedDistributor>>>>,
}

impl ScriptedFactory {
    /// Most recent instance built under `name`
    fn latest(&self, name: &str) -> Arc<ScriptedDistributor> {
        Arc::clone(self.built.lock()[name].last().unwrap())
    }

    fn builds(&self, name: &str) -> usize {
        self.built.lock().get(name).map_or(0, Vec::len)
    }
}

impl DistributorFactory for ScriptedFactory {
    fn build(
        &self,
        name: &str,
        _config: &DistributorConfig,
    ) -> Result<Arc<dyn Distributor>, DistributionError> {
        let distributor = Arc::new(ScriptedDistributor::new(name));
        self.built
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Arc::clone(&distributor));
        Ok(distributor)
    }
}

fn placeholder() -> DistributorConfig {
    DistributorConfig::Udp(UdpConfig::default())
}

fn session_with(names: &[&str]) -> SessionConfig {
    names
        .iter()
        .fold(SessionConfig::default(), |config, name| {
            config.with_distributor(*name, placeholder())
        })
}

fn scripted_manager(config: SessionManagerConfig) -> (SessionManager, Arc<ScriptedFactory>) {
    let factory = Arc::new(ScriptedFactory::default());
    let manager =
        SessionManager::with_factory(config, Arc::clone(&factory) as Arc<dyn DistributorFactory>);
    (manager, factory)
}

// =============================================================================
// FAN-OUT
// =============================================================================

#[tokio::test]
async fn test_partial_failure_reports_every_outcome() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    manager
        .create_session("lab-1", session_with(&["dashboard", "failing", "telemetry"]))
        .await
        .unwrap();

    let outcomes = manager
        .distribute_to_session("lab-1", "face_detected", json!({ "faces": 3 }))
        .await
        .unwrap();

    let names: Vec<&str> = outcomes.iter().map(|o| o.distributor.as_str()).collect();
    assert_eq!(names, vec!["dashboard", "failing", "telemetry"]);
    assert!(outcomes[0].success);
    assert!(!outcomes[1].success);
    assert_eq!(outcomes[1].error.as_deref(), Some("peer rejected event"));
    assert!(outcomes[2].success);

    assert_eq!(factory.latest("dashboard").received(), vec!["face_detected"]);

    let stats = manager.session_stats("lab-1").unwrap();
    assert_eq!(stats.messages_processed, 1);
    assert_eq!(stats.error_count, 1);
}

#[tokio::test]
async fn test_routing_selects_and_orders_targets() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    let config = session_with(&["alpha", "beta", "gamma"]).route("gaze", ["gamma", "alpha"]);
    manager.create_session("lab-1", config).await.unwrap();

    let outcomes = manager
        .distribute_to_session("lab-1", "gaze", json!({}))
        .await
        .unwrap();
    let names: Vec<&str> = outcomes.iter().map(|o| o.distributor.as_str()).collect();
    assert_eq!(names, vec!["gamma", "alpha"]);
    assert!(factory.latest("beta").received().is_empty());

    // Events without a route go everywhere
    let outcomes = manager
        .distribute_to_session("lab-1", "pose", json!({}))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(factory.latest("beta").received(), vec!["pose"]);
}

#[tokio::test]
async fn test_slow_distributor_times_out_without_blocking_others() {
    let (manager, _factory) = scripted_manager(SessionManagerConfig {
        distribute_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    manager
        .create_session("lab-1", session_with(&["fast", "slow"]))
        .await
        .unwrap();

    let outcomes = tokio::time::timeout(
        Duration::from_secs(2),
        manager.distribute_to_session("lab-1", "pose", json!({})),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(outcomes[0].success);
    assert!(!outcomes[1].success);
    assert_eq!(outcomes[1].error_code.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_failed_connect_keeps_distributor() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    manager
        .create_session("lab-1", session_with(&["flaky"]))
        .await
        .unwrap();

    assert_eq!(factory.latest("flaky").state(), LifecycleState::Error);
    let status = manager.get_session_status("lab-1").await.unwrap();
    assert_eq!(status.distributors["flaky"].health, HealthStatus::Unhealthy);

    // Error state still accepts sends
    let outcomes = manager
        .distribute_to_session("lab-1", "pose", json!({}))
        .await
        .unwrap();
    assert!(outcomes[0].success);
}

// =============================================================================
// RESILIENCE
// =============================================================================

#[tokio::test]
async fn test_breaker_opens_after_repeated_failures() {
    let (manager, factory) = scripted_manager(SessionManagerConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        },
        ..Default::default()
    });
    manager
        .create_session("lab-1", session_with(&["failing", "healthy"]))
        .await
        .unwrap();

    for _ in 0..5 {
        manager
            .distribute_to_session("lab-1", "pose", json!({}))
            .await
            .unwrap();
    }
    assert_eq!(factory.latest("failing").sends.load(Ordering::SeqCst), 5);

    let outcomes = manager
        .distribute_to_session("lab-1", "pose", json!({}))
        .await
        .unwrap();
    assert_eq!(outcomes[0].error_code.as_deref(), Some("circuit_open"));
    assert!(outcomes[1].success);
    // Short-circuited, never attempted
    assert_eq!(factory.latest("failing").sends.load(Ordering::SeqCst), 5);

    let status = manager.get_session_status("lab-1").await.unwrap();
    assert_eq!(status.circuits["failing"].state, CircuitState::Open);
    assert_eq!(status.circuits["healthy"].state, CircuitState::Closed);
}

#[tokio::test]
async fn test_rate_limit_rejects_excess_calls() {
    let (manager, _factory) = scripted_manager(SessionManagerConfig {
        rate_limit: Some(RateLimitConfig {
            max_requests_per_window: 2,
            window: Duration::from_secs(60),
            ..Default::default()
        }),
        ..Default::default()
    });
    manager
        .create_session("lab-1", session_with(&["dashboard"]))
        .await
        .unwrap();
    manager
        .create_session("lab-2", session_with(&["dashboard"]))
        .await
        .unwrap();

    for _ in 0..2 {
        manager
            .distribute_to_session("lab-1", "pose", json!({}))
            .await
            .unwrap();
    }
    let err = manager
        .distribute_to_session("lab-1", "pose", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DistributionError::RateLimitExceeded { remaining: 0, .. }
    ));
    assert_eq!(manager.session_stats("lab-1").unwrap().messages_processed, 2);

    // Limits are per session
    assert!(
        manager
            .distribute_to_session("lab-2", "pose", json!({}))
            .await
            .is_ok()
    );
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_duplicate_and_missing_sessions() {
    let (manager, _factory) = scripted_manager(SessionManagerConfig::default());
    manager
        .create_session("lab-1", session_with(&["dashboard"]))
        .await
        .unwrap();

    assert!(matches!(
        manager.create_session("lab-1", SessionConfig::default()).await,
        Err(DistributionError::SessionExists(_))
    ));
    assert!(matches!(
        manager
            .distribute_to_session("nope", "pose", json!({}))
            .await,
        Err(DistributionError::SessionNotFound(_))
    ));
    assert!(matches!(
        manager.destroy_session("nope").await,
        Err(DistributionError::SessionNotFound(_))
    ));
    assert!(manager.get_session_status("nope").await.is_err());
}

#[tokio::test]
async fn test_invalid_routing_creates_nothing() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    let config = session_with(&["dashboard"]).route("pose", ["dashboard", "mqtt"]);

    assert!(matches!(
        manager.create_session("lab-1", config).await,
        Err(DistributionError::Validation(_))
    ));
    assert_eq!(manager.session_count(), 0);
    assert_eq!(factory.builds("dashboard"), 0);
}

#[tokio::test]
async fn test_update_reconciles_distributors() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    let initial = session_with(&["dashboard", "mqtt"]).route("pose", ["mqtt"]);
    manager.create_session("lab-1", initial).await.unwrap();
    let dashboard = factory.latest("dashboard");
    let mqtt = factory.latest("mqtt");

    let updated = session_with(&["dashboard", "udp"]).route("pose", ["udp"]);
    manager
        .update_session_config("lab-1", updated)
        .await
        .unwrap();

    // Unchanged distributors survive untouched
    assert!(!dashboard.cleaned_up.load(Ordering::SeqCst));
    assert_eq!(factory.builds("dashboard"), 1);
    assert!(mqtt.cleaned_up.load(Ordering::SeqCst));
    assert_eq!(factory.latest("udp").state(), LifecycleState::Active);

    let status = manager.get_session_status("lab-1").await.unwrap();
    let names: Vec<&String> = status.distributors.keys().collect();
    assert_eq!(names, vec!["dashboard", "udp"]);
    assert_eq!(status.event_routing["pose"], vec!["udp"]);

    let outcomes = manager
        .distribute_to_session("lab-1", "pose", json!({}))
        .await
        .unwrap();
    let names: Vec<&str> = outcomes.iter().map(|o| o.distributor.as_str()).collect();
    assert_eq!(names, vec!["udp"]);
    assert_eq!(factory.latest("udp").received(), vec!["pose"]);
    assert!(mqtt.received().is_empty());
}

#[tokio::test]
async fn test_changed_config_rebuilds_distributor() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    manager
        .create_session("lab-1", session_with(&["telemetry"]))
        .await
        .unwrap();
    let first = factory.latest("telemetry");

    let changed = SessionConfig::default().with_distributor(
        "telemetry",
        DistributorConfig::Udp(UdpConfig {
            compress: true,
            ..Default::default()
        }),
    );
    manager
        .update_session_config("lab-1", changed)
        .await
        .unwrap();

    assert!(first.cleaned_up.load(Ordering::SeqCst));
    assert_eq!(factory.builds("telemetry"), 2);
    assert_eq!(factory.latest("telemetry").state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_update_with_bad_routing_leaves_session_unchanged() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    manager
        .create_session("lab-1", session_with(&["dashboard"]))
        .await
        .unwrap();

    let bad = session_with(&["udp"]).route("pose", ["ghost"]);
    assert!(manager.update_session_config("lab-1", bad).await.is_err());
    assert_eq!(factory.builds("udp"), 0);
    assert!(!factory.latest("dashboard").cleaned_up.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_destroy_and_shutdown_clean_up() {
    let (manager, factory) = scripted_manager(SessionManagerConfig::default());
    manager
        .create_session("lab-1", session_with(&["dashboard"]))
        .await
        .unwrap();
    manager
        .create_session("lab-2", session_with(&["telemetry"]))
        .await
        .unwrap();
    assert_eq!(manager.list_sessions(), vec!["lab-1", "lab-2"]);

    manager.destroy_session("lab-1").await.unwrap();
    assert!(factory.latest("dashboard").cleaned_up.load(Ordering::SeqCst));
    assert_eq!(manager.list_sessions(), vec!["lab-2"]);

    manager.shutdown().await;
    assert!(factory.latest("telemetry").cleaned_up.load(Ordering::SeqCst));
    assert_eq!(manager.session_count(), 0);
}

// =============================================================================
// END TO END
// =============================================================================

#[tokio::test]
async fn test_udp_session_end_to_end() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = peer.local_addr().unwrap().port();

    let manager = SessionManager::default();
    let config = SessionConfig::default().with_distributor(
        "telemetry",
        DistributorConfig::Udp(UdpConfig {
            bind_addr: "127.0.0.1:0".into(),
            targets: vec![UdpTarget::new("127.0.0.1", port)],
            ..Default::default()
        }),
    );
    manager.create_session("lab-1", config).await.unwrap();

    let outcomes = manager
        .distribute_to_session("lab-1", "face_detected", json!({ "faces": 1 }))
        .await
        .unwrap();
    assert!(outcomes[0].success);

    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let envelope: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(envelope["event"], "face_detected");
    assert_eq!(envelope["metadata"]["sessionId"], "lab-1");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_http_retry_schedule_outlasts_session_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    // Backoff alone (60 + 120 + 240ms) is well past the manager's bound
    let manager = SessionManager::new(SessionManagerConfig {
        distribute_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let config = SessionConfig::default().with_distributor(
        "webhook",
        DistributorConfig::Http(HttpConfig {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(60),
            timeout: Duration::from_millis(500),
            ..HttpConfig::new(server.uri())
        }),
    );
    manager.create_session("lab-1", config).await.unwrap();

    let outcomes = manager
        .distribute_to_session("lab-1", "face_detected", json!({ "faces": 1 }))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success);
    assert!(outcomes[0].error_code.is_none());
    let result = outcomes[0].result.as_ref().unwrap();
    assert!(
        result.per_target[0]
            .error
            .as_deref()
            .unwrap()
            .contains("HTTP 500")
    );

    let posts = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 4);

    manager.shutdown().await;
}
