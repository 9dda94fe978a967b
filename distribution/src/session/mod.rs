//! Session manager
//!
//! A session owns a set of named distributors and a routing table. Each
//! `distribute_to_session` call fans the event out to the routed
//! distributors concurrently and returns one [`DistributorOutcome`] per
//! distributor, in routing order (or name order when the event has no route).
//!
//! # Concurrency
//!
//! The session map is a `parking_lot` lock held only to look up or swap
//! entries. Each session has a `tokio` `RwLock` gate: distributes hold it for
//! reading across the whole fan-out, config updates and teardown take it for
//! writing, so a distributor is never cleaned up under an in-flight send.

mod config;

pub use config::{SessionConfig, SessionManagerConfig};

use crate::distribute::{DistributorConfig, DistributorFactory, ProtocolFactory};
use crate::metrics::Metrics;
use crate::resilience::{CircuitBreaker, CircuitSnapshot, RateLimiter};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use synopticon_core::{
    DeliveryResult, DistributionError, DistributionEvent, Distributor, DistributorOutcome,
    DistributorStatus, SendOptions, now_millis,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often expired rate-limit windows are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Counters of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// `distribute_to_session` calls that reached the fan-out
    pub messages_processed: u64,
    /// Failed distributor outcomes across all calls
    pub error_count: u64,
    /// Unix milliseconds at creation
    pub created_at: u64,
}

/// Monitoring view of one session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Session id
    pub id: String,
    /// Counters
    pub stats: SessionStats,
    /// Status of each distributor, by name
    pub distributors: BTreeMap<String, DistributorStatus>,
    /// Current routing table
    pub event_routing: BTreeMap<String, Vec<String>>,
    /// Breaker state of each distributor, by name
    pub circuits: BTreeMap<String, CircuitSnapshot>,
}

struct SessionState {
    distributors: BTreeMap<String, Arc<dyn Distributor>>,
    config: SessionConfig,
}

struct Session {
    id: String,
    gate: tokio::sync::RwLock<SessionState>,
    messages_processed: AtomicU64,
    error_count: AtomicU64,
    created_at: u64,
}

impl Session {
    fn stats(&self) -> SessionStats {
        SessionStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }
}

/// Owns every session and their distributors
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    factory: Arc<dyn DistributorFactory>,
    breaker: CircuitBreaker,
    limiter: Option<Arc<RateLimiter>>,
    config: SessionManagerConfig,
    cancel: CancellationToken,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manager building real protocol adapters
    pub fn new(config: SessionManagerConfig) -> Self {
        Self::with_factory(config, Arc::new(ProtocolFactory))
    }

    /// Manager with a custom distributor factory
    pub fn with_factory(config: SessionManagerConfig, factory: Arc<dyn DistributorFactory>) -> Self {
        let limiter = config
            .rate_limit
            .clone()
            .map(|rl| Arc::new(RateLimiter::new("session", rl)));
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            limiter,
            config,
            cancel: CancellationToken::new(),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    /// Start the periodic rate-limit sweep (no-op without a limiter)
    ///
    /// Needs a running tokio runtime; stopped by [`shutdown`](Self::shutdown).
    pub fn start_background_tasks(&self) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(limiter.spawn_sweeper(SWEEP_INTERVAL, self.cancel.child_token()));
        }
    }

    /// Create a session and connect its distributors
    ///
    /// A distributor that fails to connect stays in the session in its
    /// `Error` state.
    pub async fn create_session(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<(), DistributionError> {
        if self.sessions.read().contains_key(session_id) {
            return Err(DistributionError::SessionExists(session_id.to_string()));
        }
        config.validate()?;

        let distributors = self.build_all(config.distributors.iter())?;
        connect_all(session_id, distributors.iter()).await;

        let session = Arc::new(Session {
            id: session_id.to_string(),
            gate: tokio::sync::RwLock::new(SessionState {
                distributors,
                config,
            }),
            messages_processed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            created_at: now_millis(),
        });

        let raced = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(session_id) {
                true
            } else {
                sessions.insert(session_id.to_string(), Arc::clone(&session));
                false
            }
        };
        if raced {
            // Another create for the same id won while we were connecting
            let state = session.gate.write().await;
            cleanup_all(session_id, state.distributors.iter()).await;
            return Err(DistributionError::SessionExists(session_id.to_string()));
        }

        self.publish_session_count();
        let state = session.gate.read().await;
        tracing::info!(
            session_id,
            distributors = state.distributors.len(),
            routes = state.config.event_routing.len(),
            "session created"
        );
        Ok(())
    }

    /// Distribute one event within a session
    ///
    /// Partial failure is reported in the outcomes, never as an error. Errors
    /// are reserved for an unknown session or a rate-limited caller.
    pub async fn distribute_to_session(
        &self,
        session_id: &str,
        event: &str,
        data: Value,
    ) -> Result<Vec<DistributorOutcome>, DistributionError> {
        let session = self.session(session_id)?;
        if let Some(limiter) = &self.limiter {
            limiter.check(session_id)?;
        }

        let state = session.gate.read().await;
        let targets: Vec<(&String, &Arc<dyn Distributor>)> =
            match state.config.event_routing.get(event) {
                Some(names) => names
                    .iter()
                    .filter_map(|name| state.distributors.get_key_value(name))
                    .collect(),
                None => state.distributors.iter().collect(),
            };

        let event = Arc::new(DistributionEvent::new(session_id, event, data));
        let options = SendOptions::default();
        let outcomes = join_all(targets.into_iter().map(|(name, distributor)| {
            self.guarded_send(session_id, name, distributor.as_ref(), &event, &options)
        }))
        .await;

        let failed = outcomes.iter().filter(|o| !o.success).count() as u64;
        session.messages_processed.fetch_add(1, Ordering::Relaxed);
        session.error_count.fetch_add(failed, Ordering::Relaxed);

        if failed > 0 {
            tracing::debug!(
                session_id,
                event = %event.event,
                targets = outcomes.len(),
                failed,
                "partial distribution"
            );
        }
        Ok(outcomes)
    }

    /// One distributor's share of a fan-out: breaker, deadline, outcome
    async fn guarded_send(
        &self,
        session_id: &str,
        name: &str,
        distributor: &dyn Distributor,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> DistributorOutcome {
        let key = breaker_key(session_id, name);
        let permit = match self.breaker.try_acquire(&key) {
            Ok(permit) => permit,
            Err(e) => return DistributorOutcome::from_call(name, Err(e)),
        };

        let deadline = send_deadline(self.config.distribute_timeout, distributor);
        let call = match tokio::time::timeout(deadline, distributor.send(event, options)).await {
            Ok(call) => call,
            Err(_) => Err(DistributionError::Timeout(deadline)),
        };

        match &call {
            // An empty result means nobody was listening, not that the target is down
            Ok(result) if result.success || result.targeted == 0 => permit.success(),
            Ok(_) => permit.failure(),
            Err(e) => {
                tracing::warn!(session_id, distributor = name, error = %e, "distributor send failed");
                permit.failure();
            }
        }

        if let Some(m) = Metrics::get() {
            let healthy = call.as_ref().is_ok_and(|r: &DeliveryResult| r.success);
            m.set_distributor_health(session_id, name, healthy);
        }
        DistributorOutcome::from_call(name, call)
    }

    /// Reconcile a session with a new config
    ///
    /// New names are built and connected, names no longer present (or whose
    /// config changed) are cleaned up, and the routing table is replaced.
    /// Waits for in-flight distributes to finish first.
    pub async fn update_session_config(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<(), DistributionError> {
        config.validate()?;
        let session = self.session(session_id)?;
        let mut state = session.gate.write().await;

        let changed: Vec<String> = state
            .config
            .distributors
            .iter()
            .filter(|(name, old)| config.distributors.get(*name) != Some(*old))
            .map(|(name, _)| name.clone())
            .collect();
        let added: Vec<(&String, _)> = config
            .distributors
            .iter()
            .filter(|(name, new)| state.config.distributors.get(*name) != Some(*new))
            .collect();

        // Build before touching anything so a bad config leaves the session as it was
        let built = self.build_all(added.into_iter())?;

        let mut removed = BTreeMap::new();
        for name in &changed {
            if let Some(d) = state.distributors.remove(name) {
                removed.insert(name.clone(), d);
            }
        }
        cleanup_all(session_id, removed.iter()).await;
        connect_all(session_id, built.iter()).await;

        let added_count = built.len();
        state.distributors.extend(built);
        state.config = config;

        tracing::info!(
            session_id,
            removed = removed.len(),
            added = added_count,
            distributors = state.distributors.len(),
            "session config updated"
        );
        Ok(())
    }

    /// Clean up every distributor of a session and forget it
    pub async fn destroy_session(&self, session_id: &str) -> Result<(), DistributionError> {
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| DistributionError::SessionNotFound(session_id.to_string()))?;
        self.publish_session_count();

        let mut state = session.gate.write().await;
        cleanup_all(session_id, state.distributors.iter()).await;
        state.distributors.clear();

        let stats = session.stats();
        tracing::info!(
            session_id,
            messages_processed = stats.messages_processed,
            error_count = stats.error_count,
            "session destroyed"
        );
        Ok(())
    }

    /// Status of one session
    pub async fn get_session_status(&self, session_id: &str) -> Result<SessionStatus, DistributionError> {
        let session = self.session(session_id)?;
        Ok(self.status_of(&session).await)
    }

    /// Ids of every session, sorted
    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Status of every session, sorted by id
    pub async fn all_session_statuses(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        let mut statuses = Vec::with_capacity(sessions.len());
        for session in sessions {
            statuses.push(self.status_of(&session).await);
        }
        statuses
    }

    /// Counters of one session
    pub fn session_stats(&self, session_id: &str) -> Result<SessionStats, DistributionError> {
        Ok(self.session(session_id)?.stats())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Destroy every session and stop background tasks
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(task) = sweeper {
            let _ = task.await;
        }
        for id in self.list_sessions() {
            if let Err(e) = self.destroy_session(&id).await {
                tracing::debug!(session_id = %id, error = %e, "session already gone at shutdown");
            }
        }
        tracing::info!("session manager shut down");
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, DistributionError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| DistributionError::SessionNotFound(session_id.to_string()))
    }

    fn build_all<'a, I>(&self, configs: I) -> Result<BTreeMap<String, Arc<dyn Distributor>>, DistributionError>
    where
        I: Iterator<Item = (&'a String, &'a DistributorConfig)>,
    {
        configs
            .map(|(name, config)| Ok((name.clone(), self.factory.build(name, config)?)))
            .collect()
    }

    async fn status_of(&self, session: &Session) -> SessionStatus {
        let state = session.gate.read().await;
        let distributors = state
            .distributors
            .iter()
            .map(|(name, d)| (name.clone(), d.status()))
            .collect();
        let circuits = state
            .distributors
            .keys()
            .map(|name| (name.clone(), self.breaker.snapshot(&breaker_key(&session.id, name))))
            .collect();
        SessionStatus {
            id: session.id.clone(),
            stats: session.stats(),
            distributors,
            event_routing: state.config.event_routing.clone(),
            circuits,
        }
    }

    fn publish_session_count(&self) {
        if let Some(m) = Metrics::get() {
            m.set_active_sessions(self.session_count());
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionManagerConfig::default())
    }
}

/// The manager's bound, stretched to fit a distributor's own retry schedule
fn send_deadline(base: Duration, distributor: &dyn Distributor) -> Duration {
    distributor
        .delivery_budget()
        .map_or(base, |budget| budget.max(base))
}

fn breaker_key(session_id: &str, distributor: &str) -> String {
    format!("{session_id}/{distributor}")
}

async fn connect_all<'a, I>(session_id: &str, distributors: I)
where
    I: Iterator<Item = (&'a String, &'a Arc<dyn Distributor>)>,
{
    join_all(distributors.map(|(name, d)| async move {
        match d.connect().await {
            Ok(()) => tracing::info!(
                session_id,
                distributor = %name,
                protocol = %d.protocol(),
                "distributor connected"
            ),
            Err(e) => tracing::warn!(
                session_id,
                distributor = %name,
                protocol = %d.protocol(),
                error = %e,
                "distributor failed to connect, keeping it in error state"
            ),
        }
    }))
    .await;
}

async fn cleanup_all<'a, I>(session_id: &str, distributors: I)
where
    I: Iterator<Item = (&'a String, &'a Arc<dyn Distributor>)>,
{
    join_all(distributors.map(|(name, d)| async move {
        if let Err(e) = d.cleanup().await {
            tracing::warn!(session_id, distributor = %name, error = %e, "distributor cleanup failed");
        }
    }))
    .await;
}
