//! Delivery results
//!
//! Fan-out never throws for partial failures. Every target's outcome is
//! captured in a [`TargetResult`] and summarised in a [`DeliveryResult`].
//!
//! # Partial-success policy
//!
//! One rule is used everywhere (HTTP broadcast, UDP targets, WebSocket/SSE
//! connections, session fan-out): the delivery succeeded iff at least one
//! target received the event. Zero targets is not a success.

use crate::error::DistributionError;
use serde::{Deserialize, Serialize};

/// Outcome of delivering to a single target (endpoint, peer, connection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    /// Target identifier: URL, `host:port`, or connection id
    pub target: String,
    /// Whether the target accepted the event
    pub success: bool,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent on this target
    pub duration_ms: u64,
    /// Bytes put on the wire for this target
    pub bytes: usize,
}

impl TargetResult {
    /// A successful delivery
    pub fn ok(target: impl Into<String>, duration_ms: u64, bytes: usize) -> Self {
        Self {
            target: target.into(),
            success: true,
            error: None,
            duration_ms,
            bytes,
        }
    }

    /// A failed delivery
    pub fn failed(target: impl Into<String>, duration_ms: u64, error: impl ToString) -> Self {
        Self {
            target: target.into(),
            success: false,
            error: Some(error.to_string()),
            duration_ms,
            bytes: 0,
        }
    }
}

/// Summary of one send/broadcast across all of a distributor's targets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    /// At least one target received the event
    pub success: bool,
    /// Number of targets attempted
    pub targeted: usize,
    /// Number of targets that accepted
    pub delivered: usize,
    /// Number of targets that failed
    pub errors: usize,
    /// Individual outcomes, in attempt order
    pub per_target: Vec<TargetResult>,
}

impl DeliveryResult {
    /// Aggregate individual outcomes
    pub fn from_targets(per_target: Vec<TargetResult>) -> Self {
        let delivered = per_target.iter().filter(|t| t.success).count();
        let targeted = per_target.len();
        Self {
            success: delivered > 0,
            targeted,
            delivered,
            errors: targeted - delivered,
            per_target,
        }
    }

    /// Result for a delivery with nobody to deliver to
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total bytes delivered across targets
    pub fn bytes(&self) -> usize {
        self.per_target.iter().map(|t| t.bytes).sum()
    }

    /// First error message, if any target failed
    pub fn first_error(&self) -> Option<&str> {
        self.per_target.iter().find_map(|t| t.error.as_deref())
    }
}

/// Outcome of one distributor inside a session fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorOutcome {
    /// Distributor name within the session
    pub distributor: String,
    /// Mirrors `result.success`, false when the call itself failed
    pub success: bool,
    /// Delivery summary, absent when the call failed before delivering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DeliveryResult>,
    /// Error when the call failed outright (not connected, circuit open, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error code, see [`DistributionError::code`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl DistributorOutcome {
    /// Wrap a call result
    pub fn from_call(
        distributor: impl Into<String>,
        call: Result<DeliveryResult, DistributionError>,
    ) -> Self {
        let distributor = distributor.into();
        match call {
            Ok(result) => Self {
                distributor,
                success: result.success,
                error: if result.success {
                    None
                } else {
                    Some(
                        result
                            .first_error()
                            .unwrap_or("no target received the event")
                            .to_string(),
                    )
                },
                error_code: None,
                result: Some(result),
            },
            Err(e) => Self {
                distributor,
                success: false,
                result: None,
                error: Some(e.to_string()),
                error_code: Some(e.code().to_string()),
            },
        }
    }
}
