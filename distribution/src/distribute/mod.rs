//! Protocol adapters
//!
//! Four [`Distributor`](synopticon_core::Distributor) implementations:
//!
//! - [`HttpDistributor`] - POST to webhook endpoints with retry
//! - [`WebSocketDistributor`] - push to connected WebSocket clients
//! - [`SseDistributor`] - push to Server-Sent Events streams
//! - [`UdpDistributor`] - datagrams to a set of peers
//!
//! WebSocket and SSE share [`ConnectionRegistry`] for connection tracking and
//! subscription-based target selection.

pub mod config;
pub mod connections;
pub mod factory;
pub mod http;
mod server;
pub mod sse;
pub mod udp;
pub mod websocket;

pub use config::{
    DistributorConfig, HttpConfig, MAX_UDP_PAYLOAD, SseConfig, UdpConfig, UdpTarget,
    WebSocketConfig,
};
pub use connections::{ClientConnection, ClientSummary, ConnectionRegistry, SendOutcome};
pub use factory::{DistributorFactory, ProtocolFactory};
pub use http::HttpDistributor;
pub use sse::{SseDistributor, SseFrame};
pub use udp::UdpDistributor;
pub use websocket::WebSocketDistributor;
