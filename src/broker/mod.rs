//! Broker seam.
//!
//! The pipeline talks to its message broker through three async traits:
//! [`Connector`] opens connections, [`BrokerConnection`] opens channels and
//! [`BrokerChannel`] carries every AMQP-style operation the pipeline needs
//! (declare, bind, publish, consume, ack/nack).
//!
//! Two implementations are provided:
//! - [`amqp`]: a real AMQP 0.9.1 broker (RabbitMQ) through `lapin`
//! - [`memory`]: an embedded in-process broker with the same semantics,
//!   optionally backed by sled for durable queues

pub mod amqp;
pub mod memory;
pub mod topology;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

pub use memory::InMemoryBroker;
pub use topology::Topology;

/// Per-channel identifier of a delivery, used to ack or nack it.
pub type DeliveryTag = u64;

/// A message pushed to a consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("broker storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    /// Connectivity errors invalidate the cached connection/channel.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect(_) | BrokerError::ConnectionClosed | BrokerError::ChannelClosed
        )
    }
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self) -> Result<Self::Connection, BrokerError>;

    /// Human readable description of where this connector points.
    fn describe(&self) -> String;
}

/// Shorthand for the channel type of a connector.
pub type ChannelOf<C> = <<C as Connector>::Connection as BrokerConnection>::Channel;

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn declare_direct_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes `body`. `persistent` maps to AMQP delivery mode 2.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError>;

    /// Limits unacknowledged deliveries on this channel; `0` means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Starts manual-ack push consumption on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
