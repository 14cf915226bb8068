//! Embedded broker.
//!
//! `InMemoryBroker` implements the broker seam inside the process with the
//! AMQP semantics the pipeline relies on: direct routing through explicit
//! bindings, idempotent declarations, per-channel delivery tags and prefetch,
//! manual ack/nack, and redelivery of unacknowledged messages when their
//! channel goes away. Attach a [`Persistence`] and durable queues keep their
//! persistent messages across restarts.
//!
//! All state sits behind one mutex that is never held across an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::broker::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, DeliveryStream, DeliveryTag,
};
use crate::persistence::{BindingRecord, Persistence};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Debug, Clone)]
struct Envelope {
    body: Vec<u8>,
    redelivered: bool,
    store_id: Option<u64>,
}

#[derive(Debug)]
struct ConsumerSlot {
    channel: u64,
    tag: String,
    sender: DeliverySender,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    envelope: Envelope,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    next_tag: DeliveryTag,
    prefetch: u16,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<BindingRecord>,
    /// Open connections; closed ones are forgotten.
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    connections_opened: u64,
    discarded: u64,
    refuse_connections: bool,
    store: Option<Persistence>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, id: u64) -> Result<(), BrokerError> {
        if self.channels.contains_key(&id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Raises a channel-level exception: the channel is closed and the error returned.
    fn channel_error(&mut self, id: u64, err: BrokerError) -> BrokerError {
        tracing::warn!(channel = id, "closing channel after error: {err}");
        self.close_channel(id);
        err
    }

    fn close_channel(&mut self, id: u64) {
        let Some(ch) = self.channels.remove(&id) else {
            return;
        };

        // reverse tag order keeps the original FIFO order at the head
        for (_, pending) in ch.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&pending.queue) {
                let mut envelope = pending.envelope;
                envelope.redelivered = true;
                queue.ready.push_front(envelope);
            }
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != id);
        }
        self.dispatch_all();
    }

    fn close_connection(&mut self, id: u64) {
        if !self.connections.remove(&id) {
            return;
        }
        let owned: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == id)
            .map(|(id, _)| *id)
            .collect();
        for channel in owned {
            self.close_channel(channel);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    /// Pushes ready messages of `queue_name` to its consumers, round-robin,
    /// while some consumer's channel has prefetch capacity left.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let n = queue.consumers.len();
            let chosen = (0..n)
                .map(|i| (queue.next_consumer + i) % n)
                .find(|&idx| {
                    channels
                        .get(&queue.consumers[idx].channel)
                        .is_some_and(ChannelState::has_capacity)
                });
            let Some(idx) = chosen else {
                return;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                return;
            };
            let Some(channel) = channels.get_mut(&queue.consumers[idx].channel) else {
                return;
            };

            let tag = channel.next_tag + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                body: envelope.body.clone(),
                redelivered: envelope.redelivered,
            };
            if queue.consumers[idx].sender.send(Ok(delivery)).is_err() {
                // receiving side is gone; forget the consumer, keep the message
                let gone = queue.consumers.remove(idx);
                tracing::debug!(consumer = %gone.tag, "dropping consumer with closed stream");
                queue.ready.push_front(envelope);
                queue.next_consumer = 0;
                continue;
            }
            channel.next_tag = tag;
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    envelope,
                },
            );
            queue.next_consumer = (idx + 1) % n;
        }
    }

    fn forget_stored(&self, queue: &str, envelope: &Envelope) {
        if let (Some(store), Some(id)) = (&self.store, envelope.store_id) {
            if let Err(e) = store.remove_message(queue, id) {
                tracing::error!(queue, "failed to remove stored message {id}: {e}");
            }
        }
    }
}

/// An embedded AMQP-like broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("bindings", &state.bindings.len())
            .field("durable_store", &state.store.is_some())
            .finish()
    }
}

impl InMemoryBroker {
    /// A broker that forgets everything when dropped.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker whose durable declarations and persistent messages live in sled at `path`.
    pub fn open(path: &str) -> Result<Self, BrokerError> {
        Self::with_persistence(Persistence::open(path)?)
    }

    pub fn with_persistence(store: Persistence) -> Result<Self, BrokerError> {
        let mut state = BrokerState::default();

        for name in store.exchanges()? {
            state.exchanges.insert(name, true);
        }
        for name in store.queues()? {
            let ready = store
                .load_messages(&name)?
                .into_iter()
                .map(|m| Envelope {
                    body: m.body,
                    redelivered: false,
                    store_id: Some(m.id),
                })
                .collect();
            state.queues.insert(
                name,
                QueueState {
                    durable: true,
                    ready,
                    ..QueueState::default()
                },
            );
        }
        state.bindings.extend(store.bindings()?);
        tracing::info!(
            exchanges = state.exchanges.len(),
            queues = state.queues.len(),
            "restored durable broker state"
        );

        state.store = Some(store);
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes every open connection, as if the network dropped.
    pub fn sever_connections(&self) {
        let mut state = self.state();
        let open: Vec<u64> = state.connections.iter().copied().collect();
        for id in open {
            state.close_connection(id);
        }
    }

    /// Makes new connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.state().refuse_connections = !reachable;
    }

    pub fn flush(&self) -> Result<(), BrokerError> {
        if let Some(store) = &self.state().store {
            store.flush()?;
        }
        Ok(())
    }

    /// Ready (not yet delivered) messages in `queue`, or `None` if it was never declared.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.state().bindings.len()
    }

    /// Messages dropped by a nack without requeue.
    pub fn discarded_count(&self) -> u64 {
        self.state().discarded
    }

    pub fn connections_opened(&self) -> u64 {
        self.state().connections_opened
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BrokerError> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(BrokerError::Connect("connection refused".into()));
        }
        let id = state.next_id();
        state.connections.insert(id);
        state.connections_opened += 1;
        Ok(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    fn describe(&self) -> String {
        "in-memory broker".to_string()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    fn is_open(&self) -> bool {
        self.broker.state().connections.contains(&self.id)
    }

    async fn open_channel(&self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.broker.state();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_tag: 0,
                prefetch: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        state.close_connection(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // a dropped socket takes its channels with it
        self.broker.state().close_connection(self.id);
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.state().channel_open(self.id).is_ok()
    }

    async fn declare_direct_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        match state.exchanges.get(name).copied() {
            Some(existing) if existing != durable => {
                let err = BrokerError::PreconditionFailed(format!(
                    "exchange '{name}' redeclared with durable={durable}"
                ));
                return Err(state.channel_error(self.id, err));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        if durable {
            if let Some(store) = &state.store {
                store.record_exchange(name)?;
            }
        }
        state.exchanges.insert(name.to_string(), durable);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        match state.queues.get(name).map(|q| q.durable) {
            Some(existing) if existing != durable => {
                let err = BrokerError::PreconditionFailed(format!(
                    "queue '{name}' redeclared with durable={durable}"
                ));
                return Err(state.channel_error(self.id, err));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        if durable {
            if let Some(store) = &state.store {
                store.record_queue(name)?;
            }
        }
        state.queues.insert(
            name.to_string(),
            QueueState {
                durable,
                ..QueueState::default()
            },
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        let Some(exchange_durable) = state.exchanges.get(exchange).copied() else {
            let err = BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            };
            return Err(state.channel_error(self.id, err));
        };
        let Some(queue_durable) = state.queues.get(queue).map(|q| q.durable) else {
            let err = BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            };
            return Err(state.channel_error(self.id, err));
        };

        let binding = BindingRecord {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if exchange_durable && queue_durable && !state.bindings.contains(&binding) {
            if let Some(store) = &state.store {
                store.record_binding(&binding)?;
            }
        }
        state.bindings.insert(binding);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;

        // the nameless default exchange routes straight to the queue named by the key
        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else if state.exchanges.contains_key(exchange) {
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        } else {
            let err = BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            };
            return Err(state.channel_error(self.id, err));
        };

        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "unroutable message dropped");
            return Ok(());
        }

        for queue_name in targets {
            let durable = state.queues.get(&queue_name).is_some_and(|q| q.durable);
            let store_id = match (&state.store, persistent && durable) {
                (Some(store), true) => Some(store.store_message(&queue_name, body)?),
                _ => None,
            };
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(Envelope {
                    body: body.to_vec(),
                    redelivered: false,
                    store_id,
                });
            }
            state.dispatch(&queue_name);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        if let Some(ch) = state.channels.get_mut(&self.id) {
            ch.prefetch = count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(ConsumerSlot {
                channel: self.id,
                tag: consumer_tag.to_string(),
                sender,
            }),
            None => {
                let err = BrokerError::NotFound {
                    kind: "queue",
                    name: queue.to_string(),
                };
                return Err(state.channel_error(self.id, err));
            }
        }
        state.dispatch(queue);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
            queue.next_consumer = 0;
        }
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        let pending = state
            .channels
            .get_mut(&self.id)
            .and_then(|ch| ch.unacked.remove(&tag));
        let Some(pending) = pending else {
            let err = BrokerError::PreconditionFailed(format!("unknown delivery tag {tag}"));
            return Err(state.channel_error(self.id, err));
        };
        state.forget_stored(&pending.queue, &pending.envelope);
        state.dispatch_all();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        let pending = state
            .channels
            .get_mut(&self.id)
            .and_then(|ch| ch.unacked.remove(&tag));
        let Some(pending) = pending else {
            let err = BrokerError::PreconditionFailed(format!("unknown delivery tag {tag}"));
            return Err(state.channel_error(self.id, err));
        };

        if requeue {
            if let Some(queue) = state.queues.get_mut(&pending.queue) {
                let mut envelope = pending.envelope;
                envelope.redelivered = true;
                queue.ready.push_front(envelope);
            }
        } else {
            state.forget_stored(&pending.queue, &pending.envelope);
            state.discarded += 1;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        state.close_channel(self.id);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.state().close_channel(self.id);
    }
}
