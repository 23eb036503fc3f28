//! Delivery of encoded commands to the device transport.

use async_trait::async_trait;
use tracing::info;

use wakegate_core::commands::OutboundCommand;

use crate::error::Result;

#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, command: &OutboundCommand) -> Result<()>;
}

/// Used when the ingress returns commands in its response and a broker
/// bridge publishes them.
pub struct LogPublisher;

#[async_trait]
impl CommandPublisher for LogPublisher {
    async fn publish(&self, command: &OutboundCommand) -> Result<()> {
        info!(topic = %command.topic, payload = %command.payload, "command issued");
        Ok(())
    }
}
