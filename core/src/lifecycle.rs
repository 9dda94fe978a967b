//! Distributor lifecycle state machine
//!
//! ```text
//! Uninitialized ──connect──► Active ◄──► Error
//!        │                     │          │
//!        └──────cleanup────────┴──────────┴──► Stopped (terminal)
//! ```

use crate::error::DistributionError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Where a distributor is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Constructed, `connect()` not yet called
    #[default]
    Uninitialized,
    /// Connected and delivering
    Active,
    /// Connected but degraded; sends are still attempted
    Error,
    /// Cleaned up, cannot be reconnected
    Stopped,
}

impl LifecycleState {
    /// Whether `send`/`broadcast` may be attempted
    pub fn accepts_sends(self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Error)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: LifecycleState,
    connecting: bool,
}

/// Shared lifecycle guard used by every adapter
///
/// Transitions are synchronous; the lock is never held across an await.
#[derive(Debug)]
pub struct LifecycleCell {
    name: String,
    inner: Mutex<Inner>,
}

impl LifecycleCell {
    /// New cell in `Uninitialized`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Distributor name used in errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn get(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Claim the right to connect
    ///
    /// Fails with `AlreadyActive` if connected (or another connect is in
    /// flight) and with `Validation` once stopped. Must be followed by
    /// [`mark_active`](Self::mark_active) or [`mark_error`](Self::mark_error).
    pub fn begin_connect(&self) -> Result<(), DistributionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            LifecycleState::Stopped => Err(DistributionError::Validation(format!(
                "distributor '{}' is stopped and cannot reconnect",
                self.name
            ))),
            LifecycleState::Active | LifecycleState::Error => {
                Err(DistributionError::AlreadyActive(self.name.clone()))
            }
            LifecycleState::Uninitialized if inner.connecting => {
                Err(DistributionError::AlreadyActive(self.name.clone()))
            }
            LifecycleState::Uninitialized => {
                inner.connecting = true;
                Ok(())
            }
        }
    }

    /// Connection established
    pub fn mark_active(&self) {
        self.transition(LifecycleState::Active);
    }

    /// Degraded but still reachable, or connect failed
    pub fn mark_error(&self) {
        self.transition(LifecycleState::Error);
    }

    /// Move to `Stopped`; returns false if already stopped
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.connecting = false;
        if inner.state == LifecycleState::Stopped {
            return false;
        }
        inner.state = LifecycleState::Stopped;
        true
    }

    /// `Ok` when sends may be attempted, `NotConnected` otherwise
    pub fn ensure_sendable(&self) -> Result<(), DistributionError> {
        if self.get().accepts_sends() {
            Ok(())
        } else {
            Err(DistributionError::NotConnected(self.name.clone()))
        }
    }

    /// Connected and not stopped
    pub fn is_active(&self) -> bool {
        self.get().accepts_sends()
    }

    fn transition(&self, to: LifecycleState) {
        let mut inner = self.inner.lock();
        inner.connecting = false;
        // Stopped is terminal
        if inner.state != LifecycleState::Stopped {
            inner.state = to;
        }
    }
}
