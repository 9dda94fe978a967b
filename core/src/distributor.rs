//! Distributor trait
//!
//! The [`Distributor`] trait is the contract every protocol adapter
//! implements. Sessions own a set of distributors and fan events out to them.

use crate::capabilities::{Capabilities, Protocol};
use crate::delivery::DeliveryResult;
use crate::error::DistributionError;
use crate::event::{DistributionEvent, SendOptions};
use crate::lifecycle::LifecycleState;
use crate::stats::{DistributorStats, DistributorStatus, HealthStatus};
use async_trait::async_trait;
use std::time::Duration;

/// Distributor trait - delivers events to downstream consumers
///
/// # Implementation Requirements
///
/// - Must be `Send + Sync`; sessions call it from concurrent tasks
/// - `send`/`broadcast` before `connect()` or after `cleanup()` return
///   `Err(NotConnected)`, never panic
/// - Partial failure is data: report it in the returned [`DeliveryResult`]
/// - `cleanup()` is idempotent
///
/// # Example
///
/// ```ignore
/// use synopticon_core::*;
/// use async_trait::async_trait;
///
/// struct LogDistributor { lifecycle: LifecycleCell, stats: StatsRecorder }
///
/// #[async_trait]
/// impl Distributor for LogDistributor {
///     fn name(&self) -> &str { self.lifecycle.name() }
///     fn protocol(&self) -> Protocol { Protocol::Udp }
///     fn capabilities(&self) -> Capabilities { Capabilities::SEND }
///     fn state(&self) -> LifecycleState { self.lifecycle.get() }
///
///     async fn connect(&self) -> Result<(), DistributionError> {
///         self.lifecycle.begin_connect()?;
///         self.lifecycle.mark_active();
///         Ok(())
///     }
///
///     async fn send(&self, event: &DistributionEvent, _: &SendOptions)
///         -> Result<DeliveryResult, DistributionError>
///     {
///         self.lifecycle.ensure_sendable()?;
///         println!("{}", event.event);
///         Ok(DeliveryResult::from_targets(vec![TargetResult::ok("stdout", 0, 0)]))
///     }
///
///     async fn health(&self) -> HealthStatus { self.stats.health() }
///     fn stats(&self) -> DistributorStats { self.stats.snapshot() }
///
///     async fn cleanup(&self) -> Result<(), DistributionError> {
///         self.lifecycle.stop();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Distributor: Send + Sync {
    /// Instance name, unique within a session
    fn name(&self) -> &str;

    /// Wire protocol
    fn protocol(&self) -> Protocol;

    /// What this distributor can do
    fn capabilities(&self) -> Capabilities;

    /// Current lifecycle state
    fn state(&self) -> LifecycleState;

    /// Establish connections or start listening
    ///
    /// Fails with `AlreadyActive` if called twice without `cleanup()`.
    async fn connect(&self) -> Result<(), DistributionError>;

    /// Deliver one event to the distributor's default targets
    async fn send(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError>;

    /// Deliver one event to every target
    ///
    /// Defaults to `send` for protocols where every target is already a
    /// broadcast recipient.
    async fn broadcast(
        &self,
        event: &DistributionEvent,
        options: &SendOptions,
    ) -> Result<DeliveryResult, DistributionError> {
        self.send(event, options).await
    }

    /// Worst-case time of one `send` for distributors that retry internally
    ///
    /// Callers bounding a send should wait at least this long so the retry
    /// schedule can run to completion.
    fn delivery_budget(&self) -> Option<Duration> {
        None
    }

    /// Current health, probing the peer where the protocol supports it
    async fn health(&self) -> HealthStatus;

    /// Counter snapshot
    fn stats(&self) -> DistributorStats;

    /// Uniform status shape
    fn status(&self) -> DistributorStatus {
        let stats = self.stats();
        DistributorStatus {
            protocol: self.protocol(),
            active: self.state().accepts_sends(),
            health: stats.health_status,
            stats,
            details: serde_json::Value::Null,
        }
    }

    /// Shorthand for `health() == Healthy`
    async fn is_healthy(&self) -> bool {
        self.health().await == HealthStatus::Healthy
    }

    /// Release every resource and move to `Stopped`
    async fn cleanup(&self) -> Result<(), DistributionError>;
}
