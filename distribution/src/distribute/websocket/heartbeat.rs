//! Periodic `heartbeat` broadcast to every connected client

use super::WsShared;
use axum::extract::ws::Message;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use synopticon_core::now_millis;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Spawn the heartbeat loop; it exits when the shared token is cancelled
pub(super) fn spawn(shared: Arc<WsShared>, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shared.cancel.cancelled() => break,
                _ = ticker.tick() => beat(&shared),
            }
        }
        tracing::debug!(distributor = %shared.lifecycle.name(), "heartbeat stopped");
    })
}

/// Push one heartbeat frame; not counted in delivery stats
fn beat(shared: &WsShared) {
    let targets = shared.registry.all();
    if targets.is_empty() {
        return;
    }
    let frame = json!({
        "event": "heartbeat",
        "data": { "connections": targets.len() },
        "timestamp": now_millis(),
    })
    .to_string();
    let len = frame.len();
    let result = shared
        .registry
        .deliver(&targets, |_| Some((Message::Text(frame.clone().into()), len)));
    tracing::trace!(
        distributor = %shared.lifecycle.name(),
        delivered = result.delivered,
        failed = result.errors,
        "heartbeat"
    );
}
