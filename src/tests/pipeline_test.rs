//! End-to-end: producer → embedded broker → consumer → processor.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::topology::QUEUE_NAME;
use crate::broker::{BrokerChannel, BrokerConnection, InMemoryBroker, Topology};
use crate::client::{ConnectionManager, Producer, spawn_send};
use crate::consumer::{Consumer, ConsumerState, FnProcessor};
use crate::transport::{MemoryMessage, MessageKind};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

type Received = mpsc::UnboundedReceiver<(String, MessageKind)>;

fn start_consumer(
    broker: &InMemoryBroker,
    fail_on: Option<&'static str>,
) -> (
    Received,
    tokio::sync::oneshot::Sender<()>,
    tokio::task::JoinHandle<crate::utils::Result<()>>,
    tokio::sync::watch::Receiver<ConsumerState>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let processor = FnProcessor(move |text: &str, kind: MessageKind| {
        tx.send((text.to_string(), kind))?;
        if Some(text) == fail_on {
            anyhow::bail!("refusing '{text}'");
        }
        Ok(())
    });
    let consumer = Consumer::new(broker.clone(), Topology::default(), processor);
    let state = consumer.state();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        consumer
            .run(async move {
                let _ = stop_rx.await;
            })
            .await
    });
    (rx, stop_tx, handle, state)
}

async fn recv(rx: &mut Received) -> (String, MessageKind) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("processor was not called")
        .expect("processor channel closed")
}

async fn settle(broker: &InMemoryBroker) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.unacked_count() > 0 || broker.queue_depth(QUEUE_NAME).unwrap_or(0) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deliveries were not settled");
}

#[tokio::test]
async fn test_end_to_end_two_messages_in_order() {
    let broker = InMemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    let producer = Producer::new(Arc::clone(&connections));

    producer
        .send_value(json!({ "type": "extract", "text": "hello", "ts": 1_700_000_000 }))
        .await
        .unwrap();
    producer
        .send(&MemoryMessage::new(MessageKind::Summarize, "search results about graphs"))
        .await
        .unwrap();

    let (mut rx, stop, handle, _) = start_consumer(&broker, None);

    assert_eq!(recv(&mut rx).await, ("hello".to_string(), MessageKind::Extract));
    assert_eq!(
        recv(&mut rx).await,
        ("search results about graphs".to_string(), MessageKind::Summarize)
    );
    settle(&broker).await;

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    connections.close().await;

    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(0));
    assert_eq!(broker.discarded_count(), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_round_trip_preserves_fields() {
    let broker = InMemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    let producer = Arc::new(Producer::new(Arc::clone(&connections)));
    let (mut rx, stop, handle, _) = start_consumer(&broker, None);

    let samples = [
        MemoryMessage::new(MessageKind::Extract, "我喜欢喝绿茶"),
        MemoryMessage::new(MessageKind::Extract, "line\nbreak and \"quotes\""),
        MemoryMessage::new(MessageKind::Summarize, "x".repeat(10_000)),
    ];
    for message in &samples {
        let report = spawn_send(Arc::clone(&producer), message.clone())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(recv(&mut rx).await, (message.text.clone(), message.kind));
    }

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    connections.close().await;
}

#[tokio::test]
async fn test_producer_recovers_after_forced_close_while_consumer_runs() {
    let broker = InMemoryBroker::new();
    let (mut rx, stop, handle, mut state) = start_consumer(&broker, None);
    state
        .wait_for(|s| *s == ConsumerState::Listening)
        .await
        .unwrap();

    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    let producer = Producer::new(Arc::clone(&connections));
    producer
        .send(&MemoryMessage::new(MessageKind::Extract, "before"))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.0, "before");

    // drop only the producer's connection
    let (conn, _) = connections.acquire().await.unwrap();
    conn.close().await.unwrap();

    producer
        .send(&MemoryMessage::new(MessageKind::Extract, "after"))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.0, "after");

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    connections.close().await;
}

#[tokio::test]
async fn test_rejected_message_is_not_redelivered() {
    let broker = InMemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    let producer = Producer::new(Arc::clone(&connections));
    for text in ["bad", "good"] {
        producer
            .send(&MemoryMessage::new(MessageKind::Extract, text))
            .await
            .unwrap();
    }

    let (mut rx, stop, handle, _) = start_consumer(&broker, Some("bad"));
    assert_eq!(recv(&mut rx).await.0, "bad");
    assert_eq!(recv(&mut rx).await.0, "good");
    settle(&broker).await;

    // nothing else shows up: the rejected message is gone for good
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
    assert_eq!(broker.discarded_count(), 1);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    connections.close().await;
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_to_next_consumer() {
    let broker = InMemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    Producer::new(Arc::clone(&connections))
        .send(&MemoryMessage::new(MessageKind::Extract, "survives a crash"))
        .await
        .unwrap();
    connections.close().await;

    // a worker that takes the message and dies before acking
    let crashed = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let connections = ConnectionManager::new(broker, Topology::default());
            let (_conn, channel) = connections.acquire().await.unwrap();
            let mut deliveries = channel.consume(QUEUE_NAME, "doomed").await.unwrap();
            deliveries.next().await
        })
    };
    let taken = crashed.await.unwrap().unwrap().unwrap();
    assert!(!taken.redelivered);

    // the crashed worker's connection is gone, so the message is ready again
    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(1));

    let (mut rx, stop, handle, _) = start_consumer(&broker, None);
    assert_eq!(recv(&mut rx).await.0, "survives a crash");
    settle(&broker).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_persistent_messages_survive_broker_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker");
    let path = path.to_str().unwrap();

    {
        let broker = InMemoryBroker::open(path).unwrap();
        let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
        Producer::new(Arc::clone(&connections))
            .send(&MemoryMessage::new(MessageKind::Extract, "written before restart"))
            .await
            .unwrap();
        connections.close().await;
        broker.flush().unwrap();
    }

    let broker = InMemoryBroker::open(path).unwrap();
    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(1));

    let (mut rx, stop, handle, _) = start_consumer(&broker, None);
    assert_eq!(recv(&mut rx).await.0, "written before restart");
    settle(&broker).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_topology_declared_by_both_sides_once() {
    let broker = InMemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    let (_rx, stop, handle, mut state) = start_consumer(&broker, None);
    state
        .wait_for(|s| *s == ConsumerState::Listening)
        .await
        .unwrap();

    Producer::new(Arc::clone(&connections))
        .send(&MemoryMessage::new(MessageKind::Extract, "declared twice"))
        .await
        .unwrap();

    assert_eq!(broker.exchange_count(), 1);
    assert_eq!(broker.queue_count(), 1);
    assert_eq!(broker.binding_count(), 1);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    connections.close().await;
}

#[tokio::test]
async fn test_malformed_body_is_dropped_and_next_message_processed() {
    let broker = InMemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(broker.clone(), Topology::default()));
    let (_, channel) = connections.acquire().await.unwrap();
    let topology = Topology::default();
    channel
        .publish(&topology.exchange, &topology.routing_key, b"{not json", true)
        .await
        .unwrap();
    Producer::new(Arc::clone(&connections))
        .send(&MemoryMessage::new(MessageKind::Summarize, "still flowing"))
        .await
        .unwrap();

    let (mut rx, stop, handle, _) = start_consumer(&broker, None);
    assert_eq!(
        recv(&mut rx).await,
        ("still flowing".to_string(), MessageKind::Summarize)
    );
    settle(&broker).await;
    assert_eq!(broker.discarded_count(), 1);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
    connections.close().await;
}
