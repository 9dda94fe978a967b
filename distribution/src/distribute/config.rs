//! Distributor configuration
//!
//! One closed variant per protocol, tagged by `type` in JSON:
//!
//! ```json
//! { "type": "udp", "targets": [{ "host": "127.0.0.1", "port": 9999 }], "compress": true }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use synopticon_core::{DistributionError, Protocol};

/// Largest UDP payload that fits in one IPv4 datagram
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Serde helper storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Configuration of one distributor, by protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DistributorConfig {
    /// HTTP webhooks
    Http(HttpConfig),
    /// WebSocket server
    #[serde(rename = "websocket")]
    WebSocket(WebSocketConfig),
    /// Server-Sent Events server
    Sse(SseConfig),
    /// UDP datagrams
    Udp(UdpConfig),
}

impl DistributorConfig {
    /// Protocol of this variant
    pub fn protocol(&self) -> Protocol {
        match self {
            DistributorConfig::Http(_) => Protocol::Http,
            DistributorConfig::WebSocket(_) => Protocol::WebSocket,
            DistributorConfig::Sse(_) => Protocol::Sse,
            DistributorConfig::Udp(_) => Protocol::Udp,
        }
    }

    /// Reject values that can never work
    pub fn validate(&self) -> Result<(), DistributionError> {
        match self {
            DistributorConfig::Http(c) => c.validate(),
            DistributorConfig::WebSocket(c) => {
                validate_path(&c.path)?;
                if c.heartbeat_interval.is_zero() {
                    return Err(DistributionError::Validation(
                        "websocket heartbeatIntervalMs must be non-zero".into(),
                    ));
                }
                validate_capacity(c.channel_capacity)
            }
            DistributorConfig::Sse(c) => {
                validate_path(&c.path)?;
                if c.max_connections == 0 {
                    return Err(DistributionError::Validation(
                        "sse maxConnections must be at least 1".into(),
                    ));
                }
                if c.keep_alive_interval.is_zero() {
                    return Err(DistributionError::Validation(
                        "sse keepAliveIntervalMs must be non-zero".into(),
                    ));
                }
                validate_capacity(c.channel_capacity)
            }
            DistributorConfig::Udp(c) => c.validate(),
        }
    }
}

fn validate_path(path: &str) -> Result<(), DistributionError> {
    if !path.starts_with('/') {
        return Err(DistributionError::Validation(format!(
            "path '{path}' must start with '/'"
        )));
    }
    if path == "/health" {
        return Err(DistributionError::Validation(
            "path '/health' is reserved for the status route".into(),
        ));
    }
    Ok(())
}

fn validate_capacity(capacity: usize) -> Result<(), DistributionError> {
    if capacity == 0 {
        return Err(DistributionError::Validation(
            "channelCapacity must be at least 1".into(),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Endpoint names with a fixed meaning
pub mod endpoint {
    /// Default target of `send`
    pub const DATA: &str = "data";
    /// Target of `send_batch`
    pub const BATCH: &str = "batch";
    /// First entry of the health probe chain
    pub const HEALTH: &str = "health";
}

/// HTTP distributor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Scheme, host and optional prefix, e.g. `http://analytics:8080`
    pub base_url: String,
    /// Named paths under `base_url` (`data`, `batch`, `health`, extras)
    pub endpoints: BTreeMap<String, String>,
    /// Per-request deadline
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    /// Retries after the first attempt for recoverable failures
    pub retry_attempts: u32,
    /// Base backoff delay, doubled per retry
    #[serde(rename = "retryDelayMs", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
    /// Stay active when every health probe fails
    pub skip_health_check: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(endpoint::DATA.to_string(), "/api/data".to_string());
        endpoints.insert(endpoint::BATCH.to_string(), "/api/batch".to_string());
        endpoints.insert(endpoint::HEALTH.to_string(), "/api/health".to_string());
        Self {
            base_url: "http://localhost:3000".to_string(),
            endpoints,
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            headers: BTreeMap::new(),
            skip_health_check: false,
        }
    }
}

impl HttpConfig {
    /// Config pointing at `base_url` with default endpoints
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Path registered under `name`
    pub fn endpoint(&self, name: &str) -> Option<&str> {
        self.endpoints.get(name).map(String::as_str)
    }

    fn validate(&self) -> Result<(), DistributionError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(DistributionError::Validation(format!(
                "baseUrl '{}' must start with http:// or https://",
                self.base_url
            )));
        }
        if self.timeout.is_zero() {
            return Err(DistributionError::Validation(
                "http timeout must be non-zero".into(),
            ));
        }
        for (name, path) in &self.endpoints {
            if !path.starts_with('/') {
                return Err(DistributionError::Validation(format!(
                    "endpoint '{name}' path '{path}' must start with '/'"
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket distributor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketConfig {
    /// Listen host
    pub host: String,
    /// Listen port, 0 picks a free one
    pub port: u16,
    /// Upgrade path
    pub path: String,
    /// Interval of the `heartbeat` broadcast
    #[serde(rename = "heartbeatIntervalMs", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Upgrades beyond this are answered with 503
    pub max_connections: Option<usize>,
    /// Outbound frames buffered per client before drops
    pub channel_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            max_connections: None,
            channel_capacity: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE
// ─────────────────────────────────────────────────────────────────────────────

/// SSE distributor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SseConfig {
    /// Listen host
    pub host: String,
    /// Listen port, 0 picks a free one
    pub port: u16,
    /// Stream path; subscribe/unsubscribe live underneath it
    pub path: String,
    /// Streams beyond this are answered with 503
    pub max_connections: usize,
    /// Interval of keep-alive comments
    #[serde(rename = "keepAliveIntervalMs", with = "duration_ms")]
    pub keep_alive_interval: Duration,
    /// Allowed CORS origins, empty allows any
    pub cors_origins: Vec<String>,
    /// Outbound frames buffered per client before drops
    pub channel_capacity: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            path: "/events".to_string(),
            max_connections: 1000,
            keep_alive_interval: Duration::from_secs(15),
            cors_origins: Vec::new(),
            channel_capacity: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UDP
// ─────────────────────────────────────────────────────────────────────────────

/// One UDP peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UdpTarget {
    /// Host name or IP
    pub host: String,
    /// Port
    pub port: u16,
}

impl UdpTarget {
    /// Target at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn addr(&self) -> String {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => std::net::SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }
}

/// UDP distributor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpConfig {
    /// Local socket address
    pub bind_addr: String,
    /// Peers every event is sent to
    pub targets: Vec<UdpTarget>,
    /// Size limit of the serialized envelope, before compression
    pub max_payload: usize,
    /// Gzip datagrams
    pub compress: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            targets: Vec::new(),
            max_payload: MAX_UDP_PAYLOAD,
            compress: false,
        }
    }
}

impl UdpConfig {
    fn validate(&self) -> Result<(), DistributionError> {
        if self.max_payload == 0 || self.max_payload > MAX_UDP_PAYLOAD {
            return Err(DistributionError::Validation(format!(
                "udp maxPayload must be between 1 and {MAX_UDP_PAYLOAD}, got {}",
                self.max_payload
            )));
        }
        Ok(())
    }
}
