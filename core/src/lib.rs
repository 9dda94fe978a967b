//! synopticon-core - Shared contract for Synopticon event distribution
//!
//! This crate provides the types every protocol adapter and the session
//! manager agree on:
//!
//! - [`Distributor`] trait - async interface for delivering events downstream
//! - [`DistributionEvent`] / [`Envelope`] - the event and its wire form
//! - [`DeliveryResult`] - per-target outcomes with one partial-success rule
//! - [`DistributionError`] + [`ErrorKind`] - failures classified at the source
//! - [`Capabilities`], [`Protocol`], [`LifecycleState`] - typed adapter identity
//! - [`DistributorStats`], [`HealthStatus`], [`DistributorStatus`] - monitoring
//!
//! # Why this crate exists
//!
//! Adapters built outside `synopticon-distribution` (tests, downstream
//! integrations) implement `Distributor` without pulling in the HTTP,
//! WebSocket and UDP stacks:
//!
//! ```text
//! synopticon-core ◄── synopticon-distribution ◄── synopticon-runtime
//!        ▲
//!        └──────────── custom distributors
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod capabilities;
mod delivery;
mod distributor;
mod error;
/// Distribution events and their wire envelope
pub mod event;
/// Lifecycle state machine shared by adapters
pub mod lifecycle;
/// Statistics and health model
pub mod stats;

pub use capabilities::{Capabilities, Protocol};
pub use delivery::{DeliveryResult, DistributorOutcome, TargetResult};
pub use distributor::Distributor;
pub use error::{DistributionError, ErrorKind};
pub use event::{DistributionEvent, Envelope, EventId, SendOptions, now_millis};
pub use lifecycle::{LifecycleCell, LifecycleState};
pub use stats::{DistributorStats, DistributorStatus, HealthStatus, StatsRecorder};
