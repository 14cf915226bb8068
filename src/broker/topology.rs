use crate::broker::{BrokerChannel, BrokerError};
use crate::config::TopologySettings;

pub const EXCHANGE_NAME: &str = "memory.direct";
pub const QUEUE_NAME: &str = "memory.queue";
pub const ROUTING_KEY: &str = "memory.info";

/// The single exchange/queue/binding the memory pipeline runs on.
///
/// The exchange is always a durable direct exchange and the queue is always
/// durable; only the names are configurable. Nothing is auto-created: the
/// topology must be declared with [`Topology::declare`] before first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    pub const EXCHANGE_KIND: &'static str = "direct";
    pub const DURABLE: bool = true;

    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Declares the exchange, the queue and the binding between them.
    ///
    /// Each step is idempotent on the broker side, so calling this on every
    /// new channel is safe.
    pub async fn declare<Ch: BrokerChannel + ?Sized>(&self, channel: &Ch) -> Result<(), BrokerError> {
        channel
            .declare_direct_exchange(&self.exchange, Self::DURABLE)
            .await?;
        channel.declare_queue(&self.queue, Self::DURABLE).await?;
        channel
            .bind_queue(&self.queue, &self.exchange, &self.routing_key)
            .await?;

        tracing::info!(
            exchange = %self.exchange,
            queue = %self.queue,
            routing_key = %self.routing_key,
            "exchange and queue declared"
        );
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(EXCHANGE_NAME, QUEUE_NAME, ROUTING_KEY)
    }
}

impl From<&TopologySettings> for Topology {
    fn from(s: &TopologySettings) -> Self {
        Self::new(&s.exchange, &s.queue, &s.routing_key)
    }
}
