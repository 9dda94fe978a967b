//! HTTP Distributor Integration Tests
//!
//! Runs the distributor against a wiremock server to check request shape,
//! retry classification and the health probe chain.

use serde_json::{Value, json};
use std::time::Duration;
use synopticon_core::{
    DistributionError, DistributionEvent, Distributor, HealthStatus, LifecycleState, SendOptions,
};
use synopticon_distribution::distribute::{HttpConfig, HttpDistributor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// TEST INFRASTRUCTURE
// =============================================================================

fn fast_config(server: &MockServer) -> HttpConfig {
    HttpConfig {
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_millis(500),
        ..HttpConfig::new(server.uri())
    }
}

async fn mount_health(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn connected(server: &MockServer, config: HttpConfig) -> HttpDistributor {
    mount_health(server).await;
    let d = HttpDistributor::new("webhook", config).unwrap();
    d.connect().await.unwrap();
    d
}

fn event() -> DistributionEvent {
    DistributionEvent::new("lab-1", "face_detected", json!({ "faces": 2 }))
}

async fn posts_to(server: &MockServer, target: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == target)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

// =============================================================================
// SEND
// =============================================================================

#[tokio::test]
async fn test_send_posts_envelope_to_data_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let d = connected(&server, fast_config(&server)).await;

    let ev = event();
    let result = d
        .send(&ev, &SendOptions::default().with_metadata("source", "camera-2"))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.delivered, 1);
    assert!(result.bytes() > 0);

    let bodies = posts_to(&server, "/api/data").await;
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["event"], "face_detected");
    assert_eq!(body["data"]["faces"], 2);
    assert_eq!(body["metadata"]["eventId"], ev.id.as_str());
    assert_eq!(body["metadata"]["sessionId"], "lab-1");
    assert_eq!(body["metadata"]["protocol"], "http");
    assert_eq!(body["metadata"]["source"], "camera-2");

    assert_eq!(d.stats().messages_sent, 1);
}

#[tokio::test]
async fn test_named_endpoint_option() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/alerts"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    let mut config = fast_config(&server);
    config
        .endpoints
        .insert("alerts".into(), "/hooks/alerts".into());
    let d = connected(&server, config).await;

    let result = d.send(&event(), &SendOptions::endpoint("alerts")).await.unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .expect(1)
        .mount(&server)
        .await;
    let d = connected(&server, fast_config(&server)).await;

    let result = d.send(&event(), &SendOptions::default()).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.errors, 1);
    assert!(result.first_error().unwrap().contains("HTTP 404"));
    assert_eq!(posts_to(&server, "/api/data").await.len(), 1);

    // Failure degrades health but sends are still attempted
    assert_eq!(d.state(), LifecycleState::Error);
    assert_eq!(d.stats().messages_failed, 1);
}

#[tokio::test]
async fn test_server_error_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;
    let d = connected(
        &server,
        HttpConfig {
            retry_attempts: 3,
            ..fast_config(&server)
        },
    )
    .await;

    let result = d.send(&event(), &SendOptions::default()).await.unwrap();
    assert!(!result.success);
    assert_eq!(posts_to(&server, "/api/data").await.len(), 4);
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let d = connected(&server, fast_config(&server)).await;

    let result = d.send(&event(), &SendOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(posts_to(&server, "/api/data").await.len(), 2);
    assert_eq!(d.state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    let d = connected(
        &server,
        HttpConfig {
            timeout: Duration::from_millis(50),
            retry_attempts: 0,
            ..fast_config(&server)
        },
    )
    .await;

    let result = d.send(&event(), &SendOptions::default()).await.unwrap();
    assert!(!result.success);
    assert!(result.first_error().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_send_before_connect_fails() {
    let d = HttpDistributor::new("webhook", HttpConfig::new("http://127.0.0.1:1")).unwrap();
    assert!(matches!(
        d.send(&event(), &SendOptions::default()).await,
        Err(DistributionError::NotConnected(_))
    ));
}

// =============================================================================
// BROADCAST AND BATCH
// =============================================================================

#[tokio::test]
async fn test_broadcast_skips_health_and_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let mut config = fast_config(&server);
    config
        .endpoints
        .insert("alerts".into(), "/hooks/alerts".into());
    let d = connected(&server, config).await;

    let result = d.broadcast(&event(), &SendOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.targeted, 2);

    assert_eq!(posts_to(&server, "/api/data").await.len(), 1);
    assert_eq!(posts_to(&server, "/hooks/alerts").await.len(), 1);
    assert!(posts_to(&server, "/api/batch").await.is_empty());
}

#[tokio::test]
async fn test_broadcast_partial_failure_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/broken"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    let mut config = fast_config(&server);
    config
        .endpoints
        .insert("broken".into(), "/hooks/broken".into());
    let d = connected(&server, config).await;

    let result = d.broadcast(&event(), &SendOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.delivered, 1);
    assert_eq!(result.errors, 1);
}

#[tokio::test]
async fn test_send_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let d = connected(&server, fast_config(&server)).await;

    let events = vec![event(), event(), event()];
    let result = d.send_batch(&events).await.unwrap();
    assert!(result.success);

    let body = &posts_to(&server, "/api/batch").await[0];
    assert_eq!(body["count"], 3);
    assert_eq!(body["events"].as_array().unwrap().len(), 3);
    assert_eq!(body["events"][0]["event"], "face_detected");
}

// =============================================================================
// HEALTH PROBES
// =============================================================================

#[tokio::test]
async fn test_health_probe_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let d = HttpDistributor::new("webhook", fast_config(&server)).unwrap();
    d.connect().await.unwrap();
    assert_eq!(d.state(), LifecycleState::Active);
    assert_eq!(d.status().details["healthyEndpoint"], "/health");
    assert_eq!(d.health().await, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_no_health_endpoint_fails_connect() {
    let server = MockServer::start().await;
    let d = HttpDistributor::new("webhook", fast_config(&server)).unwrap();

    assert!(matches!(
        d.connect().await,
        Err(DistributionError::Connection(_))
    ));
    assert_eq!(d.state(), LifecycleState::Error);
    assert_eq!(d.stats().health_status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_skip_health_check_keeps_distributor_active() {
    let server = MockServer::start().await;
    let d = HttpDistributor::new(
        "webhook",
        HttpConfig {
            skip_health_check: true,
            ..fast_config(&server)
        },
    )
    .unwrap();

    d.connect().await.unwrap();
    assert_eq!(d.state(), LifecycleState::Active);
    assert!(d.health_check_skipped());
    assert_eq!(d.status().details["healthCheckSkipped"], true);
}

#[tokio::test]
async fn test_cleanup_is_idempotent_and_terminal() {
    let server = MockServer::start().await;
    let d = connected(&server, fast_config(&server)).await;

    d.cleanup().await.unwrap();
    d.cleanup().await.unwrap();
    assert_eq!(d.state(), LifecycleState::Stopped);
    assert!(d.connect().await.is_err());
    assert!(matches!(
        d.send(&event(), &SendOptions::default()).await,
        Err(DistributionError::NotConnected(_))
    ));
}
