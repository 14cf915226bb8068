use std::sync::Arc;

use super::connection::ConnectionManager;
use super::dispatch::{SendStatus, send_with_report, spawn_send};
use super::producer::Producer;
use crate::broker::topology::{QUEUE_NAME, Topology};
use crate::broker::{BrokerChannel, BrokerConnection, InMemoryBroker};
use crate::transport::{MemoryMessage, MessageKind};
use crate::utils::Error;
use serde_json::json;

fn manager(broker: &InMemoryBroker) -> Arc<ConnectionManager<InMemoryBroker>> {
    Arc::new(ConnectionManager::new(broker.clone(), Topology::default()))
}

#[tokio::test]
async fn test_acquire_declares_topology_once_and_reuses_handle() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);

    let (conn_a, chan_a) = connections.acquire().await.unwrap();
    let (conn_b, chan_b) = connections.acquire().await.unwrap();

    assert!(Arc::ptr_eq(&conn_a, &conn_b));
    assert!(Arc::ptr_eq(&chan_a, &chan_b));
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(0));
    assert_eq!(broker.binding_count(), 1);

    connections.close().await;
}

#[tokio::test]
async fn test_concurrent_acquire_creates_one_connection() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let connections = Arc::clone(&connections);
            tokio::spawn(async move { connections.acquire().await.map(|_| ()) })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.connections_opened(), 1);
    connections.close().await;
}

#[tokio::test]
async fn test_acquire_recreates_closed_connection() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);

    let (first, _) = connections.acquire().await.unwrap();
    broker.sever_connections();
    assert!(!first.is_open());

    let (second, channel) = connections.acquire().await.unwrap();
    assert!(second.is_open());
    assert!(channel.is_open());
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(broker.connections_opened(), 2);

    connections.close().await;
}

#[tokio::test]
async fn test_acquire_reopens_closed_channel_on_live_connection() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);

    let (conn, channel) = connections.acquire().await.unwrap();
    channel.close().await.unwrap();

    let (same_conn, new_channel) = connections.acquire().await.unwrap();
    assert!(Arc::ptr_eq(&conn, &same_conn));
    assert!(new_channel.is_open());
    assert_eq!(broker.connections_opened(), 1);

    connections.close().await;
}

#[tokio::test]
async fn test_acquire_propagates_connect_failure() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let connections = manager(&broker);

    let err = connections.acquire().await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!connections.is_connected().await);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    connections.acquire().await.unwrap();

    connections.close().await;
    connections.close().await;

    assert_eq!(broker.open_connections(), 0);
    assert!(!connections.is_connected().await);
}

#[tokio::test]
async fn test_close_tolerates_already_dropped_connection() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    connections.acquire().await.unwrap();
    broker.sever_connections();

    // nothing open any more, nothing to report
    connections.close().await;
    assert!(!connections.is_connected().await);
}

#[tokio::test]
async fn test_scope_closes_after_work() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);

    let result: Result<(), &str> = Arc::clone(&connections)
        .scope(|c| async move {
            c.acquire().await.unwrap();
            Err("work failed")
        })
        .await;

    assert!(result.is_err());
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_send_publishes_persistent_message() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    let producer = Producer::new(Arc::clone(&connections));

    producer
        .send(&MemoryMessage::new(MessageKind::Extract, "hello"))
        .await
        .unwrap();
    producer
        .send_value(json!({ "type": "summarize", "text": "paper summary" }))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(2));
    connections.close().await;
}

#[tokio::test]
async fn test_send_failure_invalidates_cached_connection() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    let producer = Producer::new(Arc::clone(&connections));
    connections.acquire().await.unwrap();

    broker.sever_connections();
    broker.set_reachable(false);
    let err = producer
        .send(&MemoryMessage::new(MessageKind::Extract, "lost"))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
    assert!(!connections.is_connected().await);

    broker.set_reachable(true);
    producer
        .send(&MemoryMessage::new(MessageKind::Extract, "delivered"))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(1));
    connections.close().await;
}

#[tokio::test]
async fn test_send_value_rejects_invalid_mapping() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    let producer = Producer::new(Arc::clone(&connections));
    connections.acquire().await.unwrap();

    let err = producer
        .send_value(json!({ "text": "no type here" }))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Serialization(_)));
    // any failure discards the cached handle
    assert!(!connections.is_connected().await);
    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(0));
}

#[tokio::test]
async fn test_routing_key_override_is_unroutable_without_binding() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    let producer = Producer::new(Arc::clone(&connections)).with_routing_key("memory.other");
    assert_eq!(producer.routing_key(), "memory.other");

    producer
        .send(&MemoryMessage::new(MessageKind::Extract, "nowhere"))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth(QUEUE_NAME), Some(0));
    connections.close().await;
}

#[tokio::test]
async fn test_spawn_send_reports_outcome() {
    let broker = InMemoryBroker::new();
    let connections = manager(&broker);
    let producer = Arc::new(Producer::new(Arc::clone(&connections)));

    let report = spawn_send(
        Arc::clone(&producer),
        MemoryMessage::new(MessageKind::Extract, "remember that I like tea"),
    )
    .await
    .unwrap();
    assert!(report.is_success());
    assert_eq!(report.message, "message sent to queue 'memory.queue'");

    broker.sever_connections();
    broker.set_reachable(false);
    let report = send_with_report(
        &producer,
        &MemoryMessage::new(MessageKind::Extract, "dropped"),
    )
    .await;
    assert_eq!(report.status, SendStatus::Error);
    assert!(!report.message.is_empty());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "error");
}
