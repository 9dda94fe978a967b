//! The distribution event and its wire envelope
//!
//! A [`DistributionEvent`] is created once per `distribute` call and shared
//! (behind an `Arc`) by every distributor the call fans out to. Each protocol
//! adapter turns it into an [`Envelope`] for the wire:
//!
//! ```text
//! { "event": "face_detected",
//!   "data": { ... },
//!   "timestamp": 1704067200000,
//!   "metadata": { "eventId": "01H...", "sessionId": "lab-1", "protocol": "udp" } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique event identifier (ULID string form)
pub type EventId = String;

/// An event handed to the distribution layer by a producer
///
/// Immutable after creation and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionEvent {
    /// ULID assigned at creation
    pub id: EventId,
    /// Event name, e.g. `face_detected`
    pub event: String,
    /// Arbitrary JSON payload
    pub data: Value,
    /// Unix milliseconds at creation
    pub timestamp: u64,
    /// Session the event is distributed in
    pub session_id: String,
}

impl DistributionEvent {
    /// Create a new event stamped with a fresh id and the current time
    pub fn new(session_id: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            event: event.into(),
            data,
            timestamp: now_millis(),
            session_id: session_id.into(),
        }
    }

    /// Build the wire envelope for a given protocol
    pub fn envelope(&self, protocol: &str, options: &SendOptions) -> Envelope {
        let mut metadata = BTreeMap::new();
        metadata.insert("eventId".to_string(), Value::String(self.id.clone()));
        metadata.insert(
            "sessionId".to_string(),
            Value::String(self.session_id.clone()),
        );
        metadata.insert("protocol".to_string(), Value::String(protocol.to_string()));
        for (key, value) in &options.metadata {
            metadata.insert(key.clone(), Value::String(value.clone()));
        }

        Envelope {
            event: self.event.clone(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            metadata,
            client_id: None,
        }
    }
}

/// JSON envelope as it appears on every wire protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event name
    pub event: String,
    /// Event payload
    pub data: Value,
    /// Unix milliseconds
    pub timestamp: u64,
    /// Event/session/protocol metadata
    pub metadata: BTreeMap<String, Value>,
    /// Recipient connection (WebSocket only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Envelope {
    /// Attach the recipient connection id
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Serialize to a JSON byte vector
    pub fn to_vec(&self) -> Result<Vec<u8>, crate::DistributionError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Per-call delivery options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Named endpoint (HTTP) to deliver to instead of the default
    pub endpoint: Option<String>,
    /// Single connection (WebSocket/SSE) to deliver to
    pub client_id: Option<String>,
    /// Extra metadata merged into the envelope
    pub metadata: BTreeMap<String, String>,
}

impl SendOptions {
    /// Target a named endpoint
    pub fn endpoint(name: impl Into<String>) -> Self {
        Self {
            endpoint: Some(name.into()),
            ..Default::default()
        }
    }

    /// Target a single connected client
    pub fn client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Current wall-clock time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
