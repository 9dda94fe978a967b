//! Building distributors from their configuration
//!
//! Sessions never construct adapters directly; they go through a
//! [`DistributorFactory`] so tests can swap in scripted distributors.

use super::config::DistributorConfig;
use super::http::HttpDistributor;
use super::sse::SseDistributor;
use super::udp::UdpDistributor;
use super::websocket::WebSocketDistributor;
use std::sync::Arc;
use synopticon_core::{DistributionError, Distributor};

/// Creates an unconnected distributor for a config entry
pub trait DistributorFactory: Send + Sync {
    /// Build `name` from `config`; the caller connects it
    fn build(
        &self,
        name: &str,
        config: &DistributorConfig,
    ) -> Result<Arc<dyn Distributor>, DistributionError>;
}

/// Default factory mapping each config variant to its adapter
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolFactory;

impl DistributorFactory for ProtocolFactory {
    fn build(
        &self,
        name: &str,
        config: &DistributorConfig,
    ) -> Result<Arc<dyn Distributor>, DistributionError> {
        config.validate()?;
        let distributor: Arc<dyn Distributor> = match config {
            DistributorConfig::Http(c) => Arc::new(HttpDistributor::new(name, c.clone())?),
            DistributorConfig::WebSocket(c) => Arc::new(WebSocketDistributor::new(name, c.clone())),
            DistributorConfig::Sse(c) => Arc::new(SseDistributor::new(name, c.clone())),
            DistributorConfig::Udp(c) => Arc::new(UdpDistributor::new(name, c.clone())),
        };
        tracing::debug!(
            distributor = name,
            protocol = %config.protocol(),
            "distributor built"
        );
        Ok(distributor)
    }
}
