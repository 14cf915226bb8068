use std::sync::Arc;

use tracing::{debug, error, info};

use crate::broker::{BrokerChannel, Connector};
use crate::client::connection::ConnectionManager;
use crate::transport::MemoryMessage;
use crate::utils::{Error, Result};

/// Publishes memory messages to the topology's exchange.
///
/// Messages are marked persistent. There is no publisher-confirm handshake
/// and no retry: on any failure the cached connection is discarded and the
/// error goes back to the caller.
pub struct Producer<C: Connector> {
    connections: Arc<ConnectionManager<C>>,
    exchange: String,
    routing_key: String,
}

impl<C: Connector> Producer<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>) -> Self {
        let topology = connections.topology();
        Self {
            exchange: topology.exchange.clone(),
            routing_key: topology.routing_key.clone(),
            connections,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.connections.topology().queue
    }

    pub async fn send(&self, message: &MemoryMessage) -> Result<()> {
        debug!(
            kind = %message.kind,
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "publishing memory message"
        );

        match self.publish(message).await {
            Ok(()) => {
                info!(
                    queue = %self.queue(),
                    exchange = %self.exchange,
                    routing_key = %self.routing_key,
                    "message sent"
                );
                Ok(())
            }
            Err(e) => self.fail(e).await,
        }
    }

    /// Sends a caller-built mapping with `text`, `type` and an optional `ts`.
    pub async fn send_value(&self, value: serde_json::Value) -> Result<()> {
        match MemoryMessage::from_value(value) {
            Ok(message) => self.send(&message).await,
            Err(e) => self.fail(e.into()).await,
        }
    }

    async fn publish(&self, message: &MemoryMessage) -> Result<()> {
        let body = message.encode()?;
        let (_connection, channel) = self.connections.acquire().await?;
        let _guard = self.connections.publish_guard().await;
        channel
            .publish(&self.exchange, &self.routing_key, &body, true)
            .await?;
        Ok(())
    }

    async fn fail(&self, err: Error) -> Result<()> {
        error!("failed to send message: {err}");
        self.connections.invalidate().await;
        Err(err)
    }
}
