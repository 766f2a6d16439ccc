// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod support;

use lapin::{
    types::{AMQPValue, LongString},
    BasicProperties,
};
use rabbitmq_retry::{
    channel::BrokerChannel,
    config::Environment,
    connection::{ConnectionManager, ConnectionStatus, ReconnectBackoff},
    headers::RetryHeaders,
    strategy::ExponentialDelayStrategy,
    topology::{QueueSpec, RetryTopology, Topology},
};
use std::{sync::Arc, time::Duration};
use support::FakeBroker;

/// Rejects every delivery of `queue` until nothing comes back, letting the
/// retry chain run in between. Returns the retry count seen on each delivery
/// and the delay queues the message went through.
async fn reject_until_parked(
    broker: &FakeBroker,
    channel: Arc<dyn BrokerChannel>,
    queue: &str,
) -> (Vec<u32>, Vec<(String, u64)>) {
    let mut counts = vec![];
    let mut trips = vec![];

    while let Some(delivery) = broker.deliver_next(queue) {
        counts.push(
            RetryHeaders::from_properties(&delivery.properties)
                .retry_count()
                .unwrap(),
        );
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        broker.pump(channel.clone()).await;
        trips.extend(broker.expire_all());

        assert!(counts.len() < 50, "message never parked");
    }

    (counts, trips)
}

async fn connected(broker: &Arc<FakeBroker>) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(Arc::new(broker.connector()), ReconnectBackoff::default());
    manager.connect().await.unwrap();
    manager
}

fn trips(steps: &[(&str, u64)]) -> Vec<(String, u64)> {
    steps.iter().map(|(q, e)| (q.to_string(), *e)).collect()
}

#[tokio::test]
async fn fixed_interval_message_is_retried_three_times_then_parked() {
    let broker = FakeBroker::new();
    let manager = connected(&broker).await;
    let topology = RetryTopology::new(manager.clone(), Environment::Production);
    topology
        .setup_queue(
            &QueueSpec::new("orders", "app")
                .routing_key("rk.orders")
                .max_retries(3)
                .delay_time_ms(3_000),
        )
        .await
        .unwrap();

    let channel = manager.channel().await.unwrap();
    channel
        .publish("app", "rk.orders", br#"{"id":1}"#, BasicProperties::default())
        .await
        .unwrap();

    let (counts, delays) = reject_until_parked(&broker, channel, "orders").await;

    assert_eq!(counts, vec![0, 1, 2, 3]);
    assert_eq!(
        delays,
        trips(&[
            ("orders.delay.step1", 3_000),
            ("orders.delay.step2", 3_000),
            ("orders.delay.step3", 3_000),
        ])
    );

    let parked = broker.messages("orders.dlq");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].data, br#"{"id":1}"#.to_vec());

    let headers = RetryHeaders::from_properties(&parked[0].properties);
    assert_eq!(headers.retry_count(), Ok(3));
    assert_eq!(headers.first_death_queue().as_deref(), Some("orders"));
    assert_eq!(broker.queue_len("orders.retry"), 0);
}

#[tokio::test]
async fn exponential_message_waits_longer_on_each_attempt() {
    let broker = FakeBroker::new();
    let manager = connected(&broker).await;
    let topology = RetryTopology::new(manager.clone(), Environment::Production);
    topology
        .setup_queue(
            &QueueSpec::new("payments", "app")
                .routing_key("rk.payments")
                .max_retries(5)
                .delay_strategy(Arc::new(ExponentialDelayStrategy::new(
                    1_000, 1.5, 60_000, 5,
                ))),
        )
        .await
        .unwrap();

    let channel = manager.channel().await.unwrap();
    channel
        .publish("app", "rk.payments", b"{}", BasicProperties::default())
        .await
        .unwrap();

    let (counts, delays) = reject_until_parked(&broker, channel, "payments").await;

    assert_eq!(counts, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(
        delays,
        trips(&[
            ("payments.delay.step1", 1_000),
            ("payments.delay.step2", 1_500),
            ("payments.delay.step3", 2_250),
            ("payments.delay.step4", 3_375),
            ("payments.delay.step5", 5_063),
        ])
    );
    assert!(delays.iter().all(|(_, e)| *e <= 60_000));
    assert_eq!(broker.queue_len("payments.dlq"), 1);
}

#[tokio::test]
async fn message_without_origin_goes_straight_to_the_dlq() {
    let broker = FakeBroker::new();
    let manager = connected(&broker).await;
    let topology = RetryTopology::new(manager.clone(), Environment::Production);
    topology
        .setup_queue(&QueueSpec::new("orders", "app").routing_key("rk.orders"))
        .await
        .unwrap();

    let channel = manager.channel().await.unwrap();
    channel
        .publish("", "orders.retry", b"{}", BasicProperties::default())
        .await
        .unwrap();
    broker.pump(channel).await;

    assert_eq!(broker.queue_len("orders.dlq"), 1);
    assert!(broker.expire_all().is_empty());
}

#[tokio::test]
async fn retry_count_written_as_text_is_honoured() {
    let broker = FakeBroker::new();
    let manager = connected(&broker).await;
    let topology = RetryTopology::new(manager.clone(), Environment::Production);
    topology
        .setup_queue(
            &QueueSpec::new("orders", "app")
                .routing_key("rk.orders")
                .max_retries(3),
        )
        .await
        .unwrap();

    let mut headers = lapin::types::FieldTable::default();
    headers.insert(
        "x-retry-count".into(),
        AMQPValue::LongString(LongString::from("2")),
    );
    let channel = manager.channel().await.unwrap();
    channel
        .publish(
            "app",
            "rk.orders",
            b"{}",
            BasicProperties::default().with_headers(headers),
        )
        .await
        .unwrap();

    let (counts, delays) = reject_until_parked(&broker, channel, "orders").await;

    assert_eq!(counts, vec![2, 3]);
    assert_eq!(delays, trips(&[("orders.delay.step3", 60_000)]));
    assert_eq!(broker.queue_len("orders.dlq"), 1);
}

#[tokio::test]
async fn repeated_setup_keeps_a_single_retry_consumer() {
    let broker = FakeBroker::new();
    let manager = connected(&broker).await;
    let topology = RetryTopology::new(manager.clone(), Environment::Production);
    let spec = QueueSpec::new("orders", "app").routing_key("rk.orders");

    topology.setup_all(&[spec.clone(), spec]).await.unwrap();

    assert_eq!(broker.consumers_of("orders.retry"), 1);
    assert!(broker.has_queue("orders.delay.step4"));
    assert!(!broker.has_queue("orders.delay.step5"));
}

#[tokio::test(start_paused = true)]
async fn retry_consumer_is_replayed_after_the_broker_drops_the_connection() {
    let broker = FakeBroker::new();
    let connector = Arc::new(broker.connector());
    let manager = ConnectionManager::new(connector.clone(), ReconnectBackoff::default());
    manager.connect().await.unwrap();

    let topology = RetryTopology::new(manager.clone(), Environment::Production);
    topology
        .setup_queue(
            &QueueSpec::new("orders", "app")
                .routing_key("rk.orders")
                .max_retries(1)
                .delay_time_ms(100),
        )
        .await
        .unwrap();
    assert_eq!(broker.consumers_of("orders.retry"), 1);

    connector.drop_connection();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.status().await, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(manager.status().await, ConnectionStatus::Connected);
    assert_eq!(manager.attempts().await, 0);
    assert_eq!(broker.consumers_of("orders.retry"), 2);

    let channel = manager.channel().await.unwrap();
    channel
        .publish("app", "rk.orders", b"{}", BasicProperties::default())
        .await
        .unwrap();
    let (counts, _) = reject_until_parked(&broker, channel, "orders").await;

    assert_eq!(counts, vec![0, 1]);
    assert_eq!(broker.queue_len("orders.dlq"), 1);
}
