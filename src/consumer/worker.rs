use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::amqp::AmqpConnector;
use crate::broker::{BrokerChannel, BrokerError, ChannelOf, Connector, Delivery, Topology};
use crate::client::ConnectionManager;
use crate::config::Settings;
use crate::consumer::processor::MemoryProcessor;
use crate::transport::MemoryMessage;
use crate::utils::Result;

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Declaring,
    Listening,
    Processing,
    Stopped,
}

/// What was sent back to the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Rejected without requeue: the message is dropped.
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    pub acked: u64,
    pub nacked: u64,
    /// Acked without calling the processor because the text was empty.
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    nacked: AtomicU64,
    skipped: AtomicU64,
}

/// Pulls memory messages off the queue and feeds them to a [`MemoryProcessor`].
///
/// Deliveries are handled one at a time in manual-ack mode. A message that
/// cannot be decoded, or whose processing fails or panics, is nacked without
/// requeue so it can never wedge the queue; everything else is acked after
/// the processor returns.
pub struct Consumer<C: Connector, P: MemoryProcessor> {
    connections: ConnectionManager<C>,
    processor: P,
    prefetch_count: u16,
    consumer_tag: String,
    state: watch::Sender<ConsumerState>,
    counters: Counters,
}

impl<C: Connector, P: MemoryProcessor> Consumer<C, P> {
    pub fn new(connector: C, topology: Topology, processor: P) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            connections: ConnectionManager::new(connector, topology),
            processor,
            prefetch_count: 1,
            consumer_tag: consumer_tag("memq"),
            state,
            counters: Counters::default(),
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_tag_prefix(mut self, prefix: &str) -> Self {
        self.consumer_tag = consumer_tag(prefix);
        self
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            acked: self.counters.acked.load(Ordering::Relaxed),
            nacked: self.counters.nacked.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Consumes until `shutdown` resolves or the broker ends the subscription.
    ///
    /// `shutdown` is only checked between deliveries; a message being
    /// processed always runs to completion and is settled first. The
    /// connection is closed on every exit path.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = self.listen(shutdown).await;
        self.set_state(ConsumerState::Stopped);
        self.connections.close().await;
        info!(stats = ?self.stats(), "consumer stopped");
        result
    }

    async fn listen<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let queue = self.connections.topology().queue.clone();

        self.set_state(ConsumerState::Declaring);
        let (_connection, channel) = self.connections.acquire().await?;
        channel.set_prefetch(self.prefetch_count).await?;
        let mut deliveries = channel.consume(&queue, &self.consumer_tag).await?;

        self.set_state(ConsumerState::Listening);
        info!(queue = %queue, consumer_tag = %self.consumer_tag, "waiting for messages");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("consumer stopped by interrupt");
                    if let Err(e) = channel.cancel(&self.consumer_tag).await {
                        debug!("cancel on shutdown failed: {e}");
                    }
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.set_state(ConsumerState::Processing);
                        self.handle_delivery(channel.as_ref(), delivery).await;
                        self.set_state(ConsumerState::Listening);
                    }
                    Some(Err(e)) => {
                        error!("delivery stream failed: {e}");
                        return Err(e.into());
                    }
                    None => {
                        warn!("delivery stream closed by broker");
                        return Err(BrokerError::ChannelClosed.into());
                    }
                }
            }
        }
    }

    /// Processes one delivery and settles it on `channel`.
    pub async fn handle_delivery(&self, channel: &ChannelOf<C>, delivery: Delivery) -> Disposition {
        let tag = delivery.delivery_tag;
        info!(delivery_tag = tag, redelivered = delivery.redelivered, "received message");

        let disposition = self.process(&delivery.body).await;
        let (settled, counter) = match disposition {
            Disposition::Ack => (channel.ack(tag).await, &self.counters.acked),
            Disposition::Nack => (channel.nack(tag, false).await, &self.counters.nacked),
        };
        match settled {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            // the broker requeues whatever it did not see settled
            Err(e) => error!(delivery_tag = tag, "failed to settle delivery: {e}"),
        }
        disposition
    }

    async fn process(&self, body: &[u8]) -> Disposition {
        let message = match MemoryMessage::decode(body) {
            Ok(message) => message,
            Err(e) => {
                error!("error processing message: {e}");
                return Disposition::Nack;
            }
        };

        if message.text.is_empty() {
            warn!("no 'text' in message, skipping");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Disposition::Ack;
        }

        let outcome = AssertUnwindSafe(self.processor.process(&message.text, message.kind))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => Disposition::Ack,
            Ok(Err(e)) => {
                error!(kind = %message.kind, "error processing message: {e:#}");
                Disposition::Nack
            }
            Err(_) => {
                error!(kind = %message.kind, "memory processor panicked");
                Disposition::Nack
            }
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }
}

impl<P: MemoryProcessor> Consumer<AmqpConnector, P> {
    pub fn from_settings(settings: &Settings, processor: P) -> Self {
        let connector = AmqpConnector::new(&settings.amqp.uri, &settings.amqp.connection_name);
        Self::new(connector, Topology::from(&settings.topology), processor)
            .with_prefetch(settings.consumer.prefetch_count)
            .with_tag_prefix(&settings.consumer.tag_prefix)
    }
}

fn consumer_tag(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
