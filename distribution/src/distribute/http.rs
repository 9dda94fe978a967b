//! HTTP webhook distributor
//!
//! POSTs the JSON envelope to `base_url + endpoint`. Each request carries a
//! deadline; 4xx responses fail immediately while 5xx, network errors and
//! timeouts are retried with doubling backoff.

use super::config::{HttpConfig, endpoint};
use crate::metrics;
use crate::resilience::{RetryPolicy, retry_until_cancelled};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use synopticon_core::{
    Capabilities, DeliveryResult, DistributionError, DistributionEvent, Distributor,
    DistributorStats, DistributorStatus, HealthStatus, LifecycleCell, LifecycleState, Protocol,
    SendOptions, StatsRecorder, TargetResult, now_millis,
};
use tokio_util::sync::CancellationToken;

/// Paths probed after the configured health path, in order
const HEALTH_FALLBACKS: [&str; 4] = ["/api/health", "/health", "/status", "/"];

/// Cap on any single backoff delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// HTTP distributor
pub struct HttpDistributor {
    lifecycle: LifecycleCell,
    config: HttpConfig,
    client: reqwest::Client,
    headers: HeaderMap,
    retry: RetryPolicy,
    stats: StatsRecorder,
    health_check_skipped: AtomicBool,
    healthy_endpoint: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl HttpDistributor {
    /// Build the distributor; no network traffic until `connect()`
    pub fn new(name: impl Into<String>, config: HttpConfig) -> Result<Self, DistributionError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                DistributionError::Validation(format!("invalid header name '{key}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                DistributionError::Validation(format!("invalid header value for '{key}': {e}"))
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DistributionError::Connection(format!("http client: {e}")))?;

        let retry = RetryPolicy {
            max_retries: config.retry_attempts,
            base_delay: config.retry_delay,
            backoff_multiplier: 2.0,
            max_delay: MAX_RETRY_DELAY,
            jitter_factor: 0.0,
        };

        Ok(Self {
            lifecycle: LifecycleCell::new(name),
            config,
            client,
            headers,
            retry,
            stats: StatsRecorder::new(),
            health_check_skipped: AtomicBool::new(false),
            healthy_endpoint: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Whether `connect()` fell back to `skip_health_check`
    pub fn health_check_skipped(&self) -> bool {
        self.health_check_skipped.load(Ordering::Relaxed)
    }

    /// Health probe paths in the order they are tried
    pub fn health_chain(&self) -> Vec<String> {
        let mut chain: Vec<String> = Vec::with_capacity(HEALTH_FALLBACKS.len() + 1);
        if let Some(configured) = self.config.endpoint(endpoint::HEALTH) {
            chain.push(configured.to_string());
        }
        for path in HEALTH_FALLBACKS {
            if !chain.iter().any(|p| p == path) {
                chain.push(path.to_string());
            }
        }
        chain
    }

    /// POST several events to the batch endpoint in one request
    ///
    /// Single attempt with twice the normal deadline.
    pub async fn send_batch(
        &self,
        events: &[DistributionEvent],
    ) -> Result<DeliveryResult, DistributionError> {
        self.lifecycle.ensure_sendable()?;
        let path = self.endpoint_path(endpoint::BATCH)?;
        let envelopes: Vec<_> = events
            .iter()
            .map(|e| e.envelope(Protocol::Http.as_str(), &SendOptions::default()))
            .collect();
        let body = serde_json::to_vec(&json!({
            "events": envelopes,
            "count": events.len(),
            "timestamp": now_millis(),
        }))?;

        let started = Instant::now();
        let url = self.url(path);
        let outcome = self
            .post_once(&url, Bytes::from(body), self.config.timeout * 2)
            .await;
        let target = to_target(&url, started, outcome);
        Ok(self.finish(vec![target], started))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn endpoint_path(&self, name: &str) -> Result<&str, DistributionError> {
        self.config
            .endpoint(name)
            .ok_or_else(|| DistributionError::Validation(format!("unknown endpoint '{name}'")))
    }

    /// One request; returns the number of body bytes sent
    async fn post_once(
        &self,
        url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<usize, DistributionError> {
        let bytes = body.len();
        let request = async {
            let response = self
                .client
                .post(url)
                .headers(self.headers.clone())
                .body(body)
                .send()
                .await
                .map_err(|e| DistributionError::Connection(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                return Ok(bytes);
            }
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
            Err(DistributionError::Http {
                status: status.as_u16(),
                message,
            })
        };

        tokio::select! {
            outcome = tokio::time::timeout(timeout, request) => {
                outcome.map_err(|_| DistributionError::Timeout(timeout))?
            }
            _ = self.cancel.cancelled() => {
                Err(DistributionError::NotConnected(self.name().to_string()))
            }
        }
    }

    /// POST with retries, always yielding a per-target outcome
    async fn post_with_retry(&self, path: &str, body: Bytes) -> TargetResult {
        let url = self.url(path);
        let started = Instant::now();
        let label = format!("http:{}", self.name());
        let outcome = retry_until_cancelled(&self.retry, &label, &self.cancel, |attempt| {
            let body = body.clone();
            let url = url.as_str();
            async move {
                tracing::trace!(distributor = %self.name(), url, attempt, "posting event");
                self.post_once(url, body, self.config.timeout).await
            }
        })
        .await;
        to_target(&url, started, outcome)
    }

    /// First health path answering 2xx
    async fn probe(&self) -> Option<String> {
        for path in self.health_chain() {
            let url = self.url(&path);
            let request = self.client.get(&url).headers(self.headers.clone()).send();
            match tokio::time::timeout(self.config.timeout, request).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    tracing::debug!(distributor = %self.name(), path, "health probe succeeded");
                    return Some(path);
                }
                Ok(Ok(response)) => {
                    tracing::debug!(
                        distributor = %self.name(),
                        path,
                        status = response.status().as_u16(),
                        "health probe rejected"
                    );
                }
                Ok(Err(e)) => {
                    tracing::debug!(distributor = %self.name(), path, error = %e, "health probe failed");
                }
                Err(_) => {
                    tracing::debug!(distributor = %self.name(), path, "health probe timed out");
                }
            }
        }
        None
    }

    fn finish(&self, per_target: Vec<TargetResult>, started: Instant) -> DeliveryResult {
        let result = DeliveryResult::from_targets(per_target);
        let elapsed = started.elapsed();
        self.stats
            .record_delivery(&result, elapsed.as_secs_f64() * 1000.0);
        metrics::try_record_delivery(Protocol::Http.as_str(), &result, elapsed);

        if result.success {
            if self.lifecycle.get() == LifecycleState::Error {
                self.lifecycle.mark_active();
            }
            self.stats.set_health(HealthStatus::Healthy);
        } else {
            tracing::warn!(
                distributor = %self.name(),
                error = result.first_error().unwrap_or("unknown"),
                "http delivery failed"
            );
            self.lifecycle.mark_error();
            self.stats.set_health(HealthStatus::Unhealthy);
        }
        result
    }
}

fn to_target(url: &str, started: Instant, outcome: Result<usize, DistributionError>) -> TargetResult {
    let elapsed = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(bytes) => TargetResult::ok(url, elapsed, bytes),
        Err(e) => TargetResult::failed(url, elapsed, e),
    }
}

#[async_trait]
impl Distributor for HttpDistributor {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEND | Capabilities::BROADCAST | Capabilities::RELIABLE
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    fn delivery_budget(&self) -> Option<Duration> {
        Some(self.retry.worst_case(self.config.timeout))
    }

    async fn connect(&self) -> Result<(), DistributionError> {
        self.lifecycle.begin_connect()?;

        if let Some(path) = self.probe().await {
            *self.healthy_endpoint.lock() = Some(path);
            self.lifecycle.mark_active();
            self.stats.set_health(HealthStatus::Healthy);
            tracing::info!(distributor = %self.name(), base_url = %self.config.base_url, "http distributor connected");
            return Ok(());
        }

        if self.config.skip_health_check {
            self.health_check_skipped.store(true, Ordering::Relaxed);
            self.lifecycle.mark_active();
            self.stats.set_health(HealthStatus::Healthy);
            tracing::warn!(
                distributor = %self.name(),
                base_url = %self.config.base_url,
                "no health endpoint responded, continuing with health check skipped"
            );
            return Ok(());
        }

        self.lifecycle.mark_error();
        self.stats.set_health(HealthStatus::Unhealthy);
        Err(DistributionError::Connection(format!(
            "no health endpoint of {} responded",
            self.config.base_url
        )))
    }

    async fn send(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.lifecycle.ensure_sendable()?;
        let name = options.endpoint.as_deref().unwrap_or(endpoint::DATA);
        let path = self.endpoint_path(name)?;
        let body = Bytes::from(event.envelope(Protocol::Http.as_str(), options).to_vec()?);

        let started = Instant::now();
        let target = self.post_with_retry(path, body).await;
        Ok(self.finish(vec![target], started))
    }

    async fn broadcast(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.lifecycle.ensure_sendable()?;
        let body = Bytes::from(event.envelope(Protocol::Http.as_str(), options).to_vec()?);

        let paths: Vec<&str> = self
            .config
            .endpoints
            .iter()
            .filter(|(name, _)| name.as_str() != endpoint::HEALTH && name.as_str() != endpoint::BATCH)
            .map(|(_, path)| path.as_str())
            .collect();
        if paths.is_empty() {
            return Ok(DeliveryResult::empty());
        }

        let started = Instant::now();
        let targets = join_all(
            paths
                .into_iter()
                .map(|path| self.post_with_retry(path, body.clone())),
        )
        .await;
        Ok(self.finish(targets, started))
    }

    async fn health(&self) -> HealthStatus {
        if !self.lifecycle.is_active() {
            return HealthStatus::Disconnected;
        }
        if self.health_check_skipped() {
            return self.stats.health();
        }
        let probed = self.probe().await;
        let health = if probed.is_some() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        *self.healthy_endpoint.lock() = probed;
        self.stats.set_health(health);
        health
    }

    fn stats(&self) -> DistributorStats {
        self.stats.snapshot()
    }

    fn status(&self) -> DistributorStatus {
        let stats = self.stats.snapshot();
        DistributorStatus {
            protocol: Protocol::Http,
            active: self.lifecycle.is_active(),
            health: stats.health_status,
            stats,
            details: json!({
                "baseUrl": self.config.base_url,
                "endpoints": self.config.endpoints,
                "healthCheckSkipped": self.health_check_skipped(),
                "healthyEndpoint": self.healthy_endpoint.lock().clone(),
            }),
        }
    }

    async fn cleanup(&self) -> Result<(), DistributionError> {
        self.cancel.cancel();
        if self.lifecycle.stop() {
            self.stats.set_health(HealthStatus::Disconnected);
            tracing::info!(distributor = %self.name(), "http distributor stopped");
        }
        Ok(())
    }
}
