//! Protocol identity and capability flags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Wire protocol of a distributor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP webhooks
    Http,
    /// WebSocket server
    #[serde(rename = "websocket")]
    WebSocket,
    /// Server-Sent Events
    Sse,
    /// UDP datagrams
    Udp,
}

impl Protocol {
    /// Lowercase label used on the wire and in metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "websocket",
            Protocol::Sse => "sse",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed capability bitset
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Point-to-point delivery
    pub const SEND: Self = Self(1);
    /// Fan-out to every target
    pub const BROADCAST: Self = Self(1 << 1);
    /// Consumers can narrow delivery by event name
    pub const SUBSCRIBE: Self = Self(1 << 2);
    /// Acknowledged delivery with retries
    pub const RELIABLE: Self = Self(1 << 3);
    /// Low-latency push
    pub const REAL_TIME: Self = Self(1 << 4);

    const NAMES: [(Capabilities, &'static str); 5] = [
        (Self::SEND, "send"),
        (Self::BROADCAST, "broadcast"),
        (Self::SUBSCRIBE, "subscribe"),
        (Self::RELIABLE, "reliable"),
        (Self::REAL_TIME, "real_time"),
    ];

    /// No capabilities
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True when every flag in `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names of the set flags
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({})", self.names().join(" | "))
    }
}

impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}
