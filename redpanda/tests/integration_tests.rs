//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! These tests are marked `#[ignore]` because they need Docker and take a while
//! to start the broker. Run them explicitly:
//!
//! ```bash
//! cargo test -p routeminds-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]

use futures::StreamExt;
use routeminds_core::event::SerializedEvent;
use routeminds_core::event_bus::{Delivery, DeliveryStream, EventBus};
use routeminds_redpanda::RedpandaEventBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WARMUP: &str = "warmup";

fn test_event(event_type: &str, data: Vec<u8>) -> SerializedEvent {
    SerializedEvent::new(event_type.to_string(), data, None)
}

/// Start a broker and return it with its bootstrap address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn bus(brokers: &str, group: &str) -> RedpandaEventBus {
    RedpandaEventBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create event bus")
}

/// Publish a warmup event until the broker accepts it, which also creates the topic.
async fn ensure_topic_exists(event_bus: &RedpandaEventBus, topic: &str) {
    for attempt in 1..=60 {
        if event_bus
            .publish(topic, &test_event(WARMUP, vec![255]))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

/// Next delivery that is not a warmup event. Warmups are acknowledged.
async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let delivery = stream
                .next()
                .await
                .expect("stream ended")
                .expect("Failed to receive event");
            if delivery.event.event_type == WARMUP {
                delivery.ack();
            } else {
                return delivery;
            }
        }
    })
    .await
    .expect("Timeout waiting for a delivery")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = bus(&brokers, "round-trip");
    ensure_topic_exists(&event_bus, "order-created").await;

    let mut stream = event_bus
        .subscribe(&["order-created"])
        .await
        .expect("Failed to subscribe");

    event_bus
        .publish("order-created", &test_event("OrderCreated.v1", vec![1, 2, 3]))
        .await
        .expect("Failed to publish");

    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.event.event_type, "OrderCreated.v1");
    assert_eq!(delivery.event.data, vec![1, 2, 3]);
    assert_eq!(delivery.delivery_count, 1);
    delivery.ack();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_delivery_is_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = bus(&brokers, "redelivery");
    ensure_topic_exists(&event_bus, "order-created").await;

    event_bus
        .publish("order-created", &test_event("OrderCreated.v1", vec![42]))
        .await
        .expect("Failed to publish");

    {
        let mut stream = event_bus
            .subscribe(&["order-created"])
            .await
            .expect("Failed to subscribe");
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.event.data, vec![42]);
        delivery.reject();
    }

    // Let the first consumer leave the group.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut stream = event_bus
        .subscribe(&["order-created"])
        .await
        .expect("Failed to resubscribe");
    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.event.data, vec![42]);
    delivery.ack();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn acknowledged_delivery_is_not_redelivered() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = bus(&brokers, "committed");
    ensure_topic_exists(&event_bus, "order-created").await;

    event_bus
        .publish("order-created", &test_event("OrderCreated.v1", vec![1]))
        .await
        .expect("Failed to publish");

    {
        let mut stream = event_bus
            .subscribe(&["order-created"])
            .await
            .expect("Failed to subscribe");
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.event.data, vec![1]);
        delivery.ack();

        // Give the consumer task time to commit before the stream is dropped.
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    event_bus
        .publish("order-created", &test_event("OrderCreated.v1", vec![2]))
        .await
        .expect("Failed to publish");

    let mut stream = event_bus
        .subscribe(&["order-created"])
        .await
        .expect("Failed to resubscribe");
    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.event.data, vec![2]);
    delivery.ack();
}
