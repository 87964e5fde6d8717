use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use marketplace_broker::rabbitmq::{ConnectionState, LapinClient, MemoryBroker};
use marketplace_broker::{Config, ConnectionManager, PublishOptions, QueueOptions, QueueService};
use serde_json::json;

use crate::common::{eventually, service, test_config, RECONNECT_DELAY};

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let broker = MemoryBroker::new();
    broker.set_connect_latency(Duration::from_millis(50));
    let manager = ConnectionManager::new(&test_config(), Arc::new(broker.clone()));

    let results = join_all((0..10).map(|_| {
        let manager = manager.clone();
        async move { manager.connect().await }
    }))
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(eventually(Duration::from_secs(1), || manager.is_connected()).await);
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn lost_connection_is_restored_without_caller_action() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    service
        .assert_queue("orders", &QueueOptions::default())
        .await
        .unwrap();
    assert!(service.is_connected());

    broker.drop_connections();
    assert!(!service.is_connected());
    assert!(service.connection().reconnect_pending());

    assert!(eventually(Duration::from_secs(2), || service.is_connected()).await);
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(service.connection().state(), ConnectionState::Connected);

    let published = service
        .publish_to_queue("orders", &json!({"id": 1}), &PublishOptions::default())
        .await
        .unwrap();
    assert!(published);
}

#[tokio::test]
async fn outage_keeps_retrying_at_the_fixed_delay() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    service.connection().connect().await.unwrap();

    broker.set_reachable(false);
    broker.drop_connections();

    assert!(eventually(Duration::from_secs(2), || broker.connect_attempts() >= 4).await);
    assert!(!service.is_connected());

    broker.set_reachable(true);
    assert!(eventually(Duration::from_secs(2), || service.is_connected()).await);
}

#[tokio::test]
async fn close_stops_reconnection() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    service.connection().connect().await.unwrap();

    broker.set_reachable(false);
    broker.drop_connections();
    service.close().await.unwrap();
    let attempts = broker.connect_attempts();

    tokio::time::sleep(RECONNECT_DELAY * 4).await;
    assert_eq!(broker.connect_attempts(), attempts);
    assert_eq!(service.connection().state(), ConnectionState::Disconnected);
    assert!(!service.connection().reconnect_pending());
}

#[tokio::test]
async fn durable_queues_survive_a_broker_restart() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    service
        .publish_to_queue("invoices", &json!({"total": 10}), &PublishOptions::default())
        .await
        .unwrap();
    service
        .publish_to_queue("invoices", &json!({"total": 0}), &PublishOptions::transient())
        .await
        .unwrap();

    broker.restart();
    assert!(eventually(Duration::from_secs(2), || service.is_connected()).await);

    let info = service.get_queue_info("invoices").await.unwrap();
    assert_eq!(info.message_count, 1);
}

#[tokio::test]
async fn publish_after_a_timed_out_publish_succeeds() {
    let broker = MemoryBroker::new();
    broker.set_connect_latency(Duration::from_millis(200));
    let service = service(&broker);

    let first = tokio::time::timeout(
        Duration::from_millis(20),
        service.publish_to_queue("orders", &json!({"id": 1}), &PublishOptions::default()),
    )
    .await;
    assert!(first.is_err());

    broker.set_connect_latency(Duration::ZERO);
    let second = tokio::time::timeout(
        Duration::from_secs(2),
        service.publish_to_queue("orders", &json!({"id": 2}), &PublishOptions::default()),
    )
    .await;
    assert!(matches!(second, Ok(Ok(true))));
    assert_eq!(broker.queue_depth("orders"), Some(1));
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance (RABBITMQ_URL)
async fn live_broker_round_trip() {
    let config = Config::load().unwrap();
    let service = QueueService::new(ConnectionManager::new(&config, Arc::new(LapinClient::new())));
    let queue = format!("integration-{}", uuid::Uuid::new_v4());

    service
        .assert_queue(
            &queue,
            &QueueOptions {
                durable: false,
                auto_delete: false,
                exclusive: false,
            },
        )
        .await
        .unwrap();
    service
        .publish_to_queue(&queue, &json!({"v": 1}), &PublishOptions::transient())
        .await
        .unwrap();

    let depth_reached = async {
        loop {
            let info = service.get_queue_info(&queue).await.unwrap();
            if info.message_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), depth_reached)
        .await
        .unwrap();

    assert_eq!(service.delete_queue(&queue).await.unwrap(), 1);
    service.close().await.unwrap();
}
