//! Client connection registry shared by the WebSocket and SSE adapters
//!
//! Holds every open connection plus the `event -> subscribers` index under a
//! single lock so the two can never disagree. Delivery uses `try_send` on
//! each connection's outbound channel; closed channels are evicted inline.

use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use synopticon_core::{DeliveryResult, Protocol, TargetResult, now_millis};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Result of pushing one frame to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued
    Sent,
    /// Channel full, frame dropped
    Full,
    /// Client gone
    Closed,
}

/// Per-client row in a distributor's status details
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    /// Connection id
    pub client_id: String,
    /// Unix milliseconds at connect
    pub connected_at: u64,
    /// Milliseconds since the last frame in either direction
    pub idle_ms: u64,
    /// Subscribed events
    pub subscriptions: Vec<String>,
    /// Frames dropped on a full channel
    pub dropped: u64,
}

/// One connected WebSocket/SSE client
pub struct ClientConnection<M> {
    /// Connection id (`ws_<ulid>` / `sse_<ulid>`)
    pub id: String,
    tx: mpsc::Sender<M>,
    /// Unix milliseconds at connect
    pub connected_at_ms: u64,
    last_activity: Mutex<Instant>,
    subscriptions: Mutex<BTreeSet<String>>,
    dropped: AtomicU64,
}

impl<M> ClientConnection<M> {
    /// Create a connection around its outbound channel
    pub fn new(id: impl Into<String>, tx: mpsc::Sender<M>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            tx,
            connected_at_ms: now_millis(),
            last_activity: Mutex::new(now),
            subscriptions: Mutex::new(BTreeSet::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame without waiting
    pub fn send(&self, message: M) -> SendOutcome {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.touch();
                SendOutcome::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Record client activity
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last frame in either direction
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Events this connection opted into, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Frames dropped because the channel was full
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Status view of this client
    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            client_id: self.id.clone(),
            connected_at: self.connected_at_ms,
            idle_ms: self.idle_for().as_millis() as u64,
            subscriptions: self.subscriptions(),
            dropped: self.drop_count(),
        }
    }

    /// Whether the receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Inner<M> {
    connections: HashMap<String, Arc<ClientConnection<M>>>,
    index: HashMap<String, HashSet<String>>,
}

/// Connection registry plus subscription index
pub struct ConnectionRegistry<M> {
    protocol: Protocol,
    distributor: String,
    inner: RwLock<Inner<M>>,
}

impl<M> ConnectionRegistry<M> {
    /// Empty registry; `protocol` and `distributor` label the connections gauge
    pub fn new(protocol: Protocol, distributor: impl Into<String>) -> Self {
        Self {
            protocol,
            distributor: distributor.into(),
            inner: RwLock::new(Inner {
                connections: HashMap::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Register a connection unless `max` connections are already open
    pub fn try_insert(&self, connection: Arc<ClientConnection<M>>, max: Option<usize>) -> bool {
        let count = {
            let mut inner = self.inner.write();
            if max.is_some_and(|max| inner.connections.len() >= max) {
                return false;
            }
            inner
                .connections
                .insert(connection.id.clone(), connection);
            inner.connections.len()
        };
        metrics::try_set_active_connections(self.protocol.as_str(), &self.distributor, count);
        true
    }

    /// Remove a connection and every subscription it holds
    pub fn remove(&self, id: &str) -> Option<Arc<ClientConnection<M>>> {
        let (removed, count) = {
            let mut inner = self.inner.write();
            let removed = inner.connections.remove(id);
            if let Some(conn) = &removed {
                let events = conn.subscriptions.lock().clone();
                for event in events {
                    unindex(&mut inner.index, &event, id);
                }
            }
            (removed, inner.connections.len())
        };
        if removed.is_some() {
            metrics::try_set_active_connections(self.protocol.as_str(), &self.distributor, count);
        }
        removed
    }

    /// Look up a connection
    pub fn get(&self, id: &str) -> Option<Arc<ClientConnection<M>>> {
        self.inner.read().connections.get(id).cloned()
    }

    /// Subscribe `id` to `event`; false when the connection is unknown
    pub fn subscribe(&self, id: &str, event: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get(id).cloned() else {
            return false;
        };
        conn.subscriptions.lock().insert(event.to_string());
        inner
            .index
            .entry(event.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    /// Unsubscribe `id` from `event`; false when the connection is unknown
    pub fn unsubscribe(&self, id: &str, event: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get(id).cloned() else {
            return false;
        };
        conn.subscriptions.lock().remove(event);
        unindex(&mut inner.index, event, id);
        true
    }

    /// Recipients of `event`
    ///
    /// `client_id` narrows to one connection. Otherwise the subscribers of
    /// `event` when there are any, else every open connection.
    pub fn select_targets(
        &self,
        event: &str,
        client_id: Option<&str>,
    ) -> Vec<Arc<ClientConnection<M>>> {
        let inner = self.inner.read();
        if let Some(id) = client_id {
            return inner.connections.get(id).cloned().into_iter().collect();
        }
        match inner.index.get(event) {
            Some(ids) if !ids.is_empty() => {
                let mut targets: Vec<_> = ids
                    .iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect();
                targets.sort_by(|a, b| a.id.cmp(&b.id));
                targets
            }
            _ => {
                let mut targets: Vec<_> = inner.connections.values().cloned().collect();
                targets.sort_by(|a, b| a.id.cmp(&b.id));
                targets
            }
        }
    }

    /// Every open connection, ignoring subscriptions
    pub fn all(&self) -> Vec<Arc<ClientConnection<M>>> {
        let mut targets: Vec<_> = self.inner.read().connections.values().cloned().collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }

    /// Status rows for every connection, ordered by id
    pub fn summaries(&self) -> Vec<ClientSummary> {
        self.all().iter().map(|c| c.summary()).collect()
    }

    /// Push one frame to each target and summarise
    ///
    /// `frame` builds the message for a connection and reports its size.
    /// Closed connections are evicted; full channels count as failures only.
    pub fn deliver<F>(&self, targets: &[Arc<ClientConnection<M>>], mut frame: F) -> DeliveryResult
    where
        F: FnMut(&ClientConnection<M>) -> Option<(M, usize)>,
    {
        let mut per_target = Vec::with_capacity(targets.len());
        let mut dead = Vec::new();

        for conn in targets {
            let started = Instant::now();
            let Some((message, bytes)) = frame(conn) else {
                per_target.push(TargetResult::failed(&conn.id, 0, "frame encoding failed"));
                continue;
            };
            let elapsed = started.elapsed().as_millis() as u64;
            match conn.send(message) {
                SendOutcome::Sent => per_target.push(TargetResult::ok(&conn.id, elapsed, bytes)),
                SendOutcome::Full => {
                    per_target.push(TargetResult::failed(&conn.id, elapsed, "send buffer full"))
                }
                SendOutcome::Closed => {
                    per_target.push(TargetResult::failed(&conn.id, elapsed, "connection closed"));
                    dead.push(conn.id.clone());
                }
            }
        }

        for id in dead {
            if self.remove(&id).is_some() {
                tracing::debug!(protocol = %self.protocol, client_id = %id, "evicted closed connection");
            }
        }

        DeliveryResult::from_targets(per_target)
    }

    /// Remove every connection and clear the index
    pub fn drain(&self) -> Vec<Arc<ClientConnection<M>>> {
        let drained: Vec<_> = {
            let mut inner = self.inner.write();
            inner.index.clear();
            inner.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            conn.subscriptions.lock().clear();
        }
        metrics::try_set_active_connections(self.protocol.as_str(), &self.distributor, 0);
        drained
    }

    /// Open connections
    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// No open connections
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribers of `event`
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner.read().index.get(event).map_or(0, HashSet::len)
    }

    /// Event names with at least one subscriber, sorted
    pub fn subscribed_events(&self) -> Vec<String> {
        let mut events: Vec<_> = self.inner.read().index.keys().cloned().collect();
        events.sort();
        events
    }
}

fn unindex(index: &mut HashMap<String, HashSet<String>>, event: &str, id: &str) {
    if let Some(ids) = index.get_mut(event) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(event);
        }
    }
}
