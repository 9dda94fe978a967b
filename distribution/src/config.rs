//! Process configuration from environment variables
//!
//! | variable | default |
//! |----------|---------|
//! | `SYNOPTICON_METRICS_ADDR` | `0.0.0.0:9090` |
//! | `SYNOPTICON_LOG_LEVEL` | `info` |
//! | `SYNOPTICON_LOG_FORMAT` | `pretty` (`pretty` or `json`) |
//! | `SYNOPTICON_SESSIONS_FILE` | unset |
//! | `SYNOPTICON_DISTRIBUTE_TIMEOUT_MS` | `5000` |
//! | `SYNOPTICON_CB_FAILURE_THRESHOLD` | `5` |
//! | `SYNOPTICON_CB_RECOVERY_TIMEOUT_MS` | `30000` |
//! | `SYNOPTICON_RATE_LIMIT_MAX` | unset (no limit) |
//! | `SYNOPTICON_RATE_LIMIT_WINDOW_MS` | `60000` |

use crate::error::{Result, SynopticonError};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use crate::session::{SessionConfig, SessionManagerConfig};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = SynopticonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(SynopticonError::Config(format!(
                "SYNOPTICON_LOG_FORMAT must be 'pretty' or 'json', got '{other}'"
            ))),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Status/metrics server listen address
    pub metrics_addr: SocketAddr,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// JSON file of `{sessionId: SessionConfig}` created at startup
    pub sessions_file: Option<PathBuf>,
    /// Bound on each distributor's share of a fan-out
    pub distribute_timeout: Duration,
    /// Consecutive failures that open a circuit
    pub cb_failure_threshold: u32,
    /// Time an open circuit waits before a trial call
    pub cb_recovery_timeout: Duration,
    /// Per-session call limit, disabled when `None`
    pub rate_limit_max: Option<u32>,
    /// Window of the per-session call limit
    pub rate_limit_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            sessions_file: None,
            distribute_timeout: Duration::from_millis(5000),
            cb_failure_threshold: 5,
            cb_recovery_timeout: Duration::from_millis(30_000),
            rate_limit_max: None,
            rate_limit_window: Duration::from_millis(60_000),
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Config {
            metrics_addr: parse_or(&get, "SYNOPTICON_METRICS_ADDR", defaults.metrics_addr)?,
            log_level: get("SYNOPTICON_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: match get("SYNOPTICON_LOG_FORMAT") {
                Some(v) => v.parse()?,
                None => defaults.log_format,
            },
            sessions_file: get("SYNOPTICON_SESSIONS_FILE").map(PathBuf::from),
            distribute_timeout: millis_or(
                &get,
                "SYNOPTICON_DISTRIBUTE_TIMEOUT_MS",
                defaults.distribute_timeout,
            )?,
            cb_failure_threshold: parse_or(
                &get,
                "SYNOPTICON_CB_FAILURE_THRESHOLD",
                defaults.cb_failure_threshold,
            )?,
            cb_recovery_timeout: millis_or(
                &get,
                "SYNOPTICON_CB_RECOVERY_TIMEOUT_MS",
                defaults.cb_recovery_timeout,
            )?,
            rate_limit_max: match get("SYNOPTICON_RATE_LIMIT_MAX") {
                Some(v) => Some(parse("SYNOPTICON_RATE_LIMIT_MAX", &v)?),
                None => None,
            },
            rate_limit_window: millis_or(
                &get,
                "SYNOPTICON_RATE_LIMIT_WINDOW_MS",
                defaults.rate_limit_window,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.distribute_timeout.is_zero() {
            return Err(SynopticonError::Config(
                "SYNOPTICON_DISTRIBUTE_TIMEOUT_MS must be greater than 0".into(),
            ));
        }
        if self.cb_failure_threshold == 0 {
            return Err(SynopticonError::Config(
                "SYNOPTICON_CB_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.rate_limit_max == Some(0) {
            return Err(SynopticonError::Config(
                "SYNOPTICON_RATE_LIMIT_MAX must be at least 1".into(),
            ));
        }
        if self.rate_limit_max.is_some() && self.rate_limit_window.is_zero() {
            return Err(SynopticonError::Config(
                "SYNOPTICON_RATE_LIMIT_WINDOW_MS must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Session manager settings derived from this config
    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            distribute_timeout: self.distribute_timeout,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.cb_failure_threshold,
                recovery_timeout: self.cb_recovery_timeout,
            },
            rate_limit: self.rate_limit_max.map(|max| RateLimitConfig {
                max_requests_per_window: max,
                window: self.rate_limit_window,
                grace: self.rate_limit_window,
            }),
        }
    }
}

/// Read a `{sessionId: SessionConfig}` file
pub fn load_sessions_file(path: &Path) -> Result<BTreeMap<String, SessionConfig>> {
    let raw = std::fs::read_to_string(path)?;
    let sessions: BTreeMap<String, SessionConfig> = serde_json::from_str(&raw)?;
    for (id, config) in &sessions {
        config
            .validate()
            .map_err(|e| SynopticonError::Config(format!("session '{id}': {e}")))?;
    }
    Ok(sessions)
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SynopticonError::Config(format!("{key}='{value}': {e}")))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => parse(key, &v),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.session_manager_config().rate_limit.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SYNOPTICON_METRICS_ADDR", "127.0.0.1:9100"),
            ("SYNOPTICON_LOG_FORMAT", "JSON"),
            ("SYNOPTICON_DISTRIBUTE_TIMEOUT_MS", "250"),
            ("SYNOPTICON_CB_FAILURE_THRESHOLD", "3"),
            ("SYNOPTICON_RATE_LIMIT_MAX", "10"),
            ("SYNOPTICON_RATE_LIMIT_WINDOW_MS", "5000"),
            ("SYNOPTICON_SESSIONS_FILE", "/etc/synopticon/sessions.json"),
        ]))
        .unwrap();

        assert_eq!(config.metrics_addr.port(), 9100);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.distribute_timeout, Duration::from_millis(250));
        assert_eq!(
            config.sessions_file.as_deref(),
            Some(Path::new("/etc/synopticon/sessions.json"))
        );

        let manager = config.session_manager_config();
        assert_eq!(manager.circuit_breaker.failure_threshold, 3);
        let rl = manager.rate_limit.unwrap();
        assert_eq!(rl.max_requests_per_window, 10);
        assert_eq!(rl.window, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        for vars in [
            [("SYNOPTICON_METRICS_ADDR", "not-an-addr")],
            [("SYNOPTICON_LOG_FORMAT", "xml")],
            [("SYNOPTICON_CB_FAILURE_THRESHOLD", "0")],
            [("SYNOPTICON_DISTRIBUTE_TIMEOUT_MS", "-5")],
        ] {
            assert!(matches!(
                Config::from_lookup(lookup(&vars)),
                Err(SynopticonError::Config(_))
            ));
        }
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[("SYNOPTICON_LOG_LEVEL", "  ")])).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_sessions_file() {
        let path = std::env::temp_dir().join(format!("synopticon-sessions-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "lab-1": { "distributors": { "udp": { "type": "udp" } } } }"#,
        )
        .unwrap();
        let sessions = load_sessions_file(&path).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions["lab-1"].distributors.contains_key("udp"));

        std::fs::write(
            &path,
            r#"{ "lab-1": { "eventRouting": { "e": ["missing"] } } }"#,
        )
        .unwrap();
        assert!(matches!(
            load_sessions_file(&path),
            Err(SynopticonError::Config(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
