use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use marketplace_broker::control::{BindRequest, ControlSurface, CreateQueueRequest, PublishRequest};
use marketplace_broker::rabbitmq::{MaxRedeliveries, MemoryBroker};
use marketplace_broker::{ConsumeOptions, PublishOptions, QueueOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::common::{eventually, service};

#[derive(Debug, Deserialize, PartialEq)]
struct Echo {
    v: u32,
}

#[tokio::test]
async fn echo_round_trip_is_delivered_once() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    service
        .consume_from_queue(
            "test.echo",
            move |echo: Echo| {
                let tx = tx.clone();
                async move {
                    tx.send(echo)?;
                    Ok(())
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();
    service
        .publish_to_queue("test.echo", &json!({"v": 1}), &PublishOptions::default())
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(received, Some(Echo { v: 1 }));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    assert!(eventually(Duration::from_secs(1), || broker.unacked_count("test.echo") == Some(0)).await);
    let info = service.get_queue_info("test.echo").await.unwrap();
    assert_eq!(info.message_count, 0);
}

#[tokio::test]
async fn exchange_fans_out_to_every_matching_binding() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    service.bind_queue("A", "events", "user.*").await.unwrap();
    service.bind_queue("B", "events", "user.*").await.unwrap();

    service
        .publish_to_exchange(
            "events",
            "user.created",
            &json!({"user": "ada"}),
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    for queue in ["A", "B"] {
        let mut subscription = service
            .subscribe(queue, ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.routing_key, "user.created");
        assert_eq!(delivery.json::<Value>().unwrap(), json!({"user": "ada"}));
        delivery.ack().await.unwrap();
    }
}

#[tokio::test]
async fn topic_patterns_route_by_word() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    service.bind_queue("orders-single", "orders", "orders.*").await.unwrap();
    service.bind_queue("orders-any", "orders", "orders.#").await.unwrap();

    for key in [
        "orders.created",
        "orders.cancelled",
        "payments.created",
        "orders.created.europe",
    ] {
        service
            .publish_to_exchange("orders", key, &json!({"key": key}), &PublishOptions::default())
            .await
            .unwrap();
    }

    let single = service.get_queue_info("orders-single").await.unwrap();
    let any = service.get_queue_info("orders-any").await.unwrap();
    assert_eq!(single.message_count, 2);
    assert_eq!(any.message_count, 3);
}

#[tokio::test]
async fn declaring_twice_is_harmless() {
    let broker = MemoryBroker::new();
    let service = service(&broker);

    let first = service
        .assert_queue("payments", &QueueOptions::default())
        .await
        .unwrap();
    let second = service
        .assert_queue("payments", &QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn poison_message_keeps_being_redelivered() {
    let broker = MemoryBroker::new();
    let service = service(&broker);
    let attempts = Arc::new(AtomicUsize::new(0));

    let seen = attempts.clone();
    service
        .consume_from_queue(
            "poison",
            move |_: Value| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("cannot process")) }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();
    service
        .publish_to_queue("poison", &json!({"bad": true}), &PublishOptions::default())
        .await
        .unwrap();

    // first delivery plus at least three redeliveries
    assert!(eventually(Duration::from_secs(2), || attempts.load(Ordering::SeqCst) >= 4).await);
    assert!(service.is_connected());
    service.close().await.unwrap();
}

#[tokio::test]
async fn max_redeliveries_policy_drops_poison_messages() {
    let broker = MemoryBroker::new();
    let service = service(&broker).with_failure_policy(MaxRedeliveries::new(3));
    let attempts = Arc::new(AtomicUsize::new(0));

    let seen = attempts.clone();
    service
        .consume_from_queue(
            "poison",
            move |_: Value| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("cannot process")) }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();
    service
        .publish_to_queue(
            "poison",
            &json!({"bad": true}),
            &PublishOptions::default().with_message_id("poison-1"),
        )
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || attempts.load(Ordering::SeqCst) == 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_depth("poison"), Some(0));
    assert_eq!(broker.unacked_count("poison"), Some(0));
}

#[tokio::test]
async fn transient_queue_accepts_publishes_and_bindings() {
    let broker = MemoryBroker::new();
    let surface = ControlSurface::new(service(&broker));

    surface
        .create_queue(CreateQueueRequest {
            queue: "sessions".to_string(),
            options: QueueOptions {
                durable: false,
                exclusive: false,
                auto_delete: false,
            },
        })
        .await
        .unwrap();
    surface
        .bind(BindRequest {
            queue: "sessions".to_string(),
            exchange: "events".to_string(),
            routing_key: "session.*".to_string(),
        })
        .await
        .unwrap();

    for (queue, exchange, routing_key) in [
        (Some("sessions"), None, None),
        (None, Some("events"), Some("session.started")),
    ] {
        let response = surface
            .publish(PublishRequest {
                queue: queue.map(str::to_string),
                exchange: exchange.map(str::to_string),
                routing_key: routing_key.map(str::to_string),
                message: json!({"session": 1}),
                options: PublishOptions::transient(),
            })
            .await
            .unwrap();
        assert!(response.published);
    }

    let info = surface.get_queue_info("sessions").await.unwrap();
    assert_eq!(info.message_count, 2);
}
