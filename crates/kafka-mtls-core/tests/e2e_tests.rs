//! End-to-end tests: producer loop, consumer engine and the real client
//! talking mTLS to the mock broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_mtls_core::client::{KafkaClient, MessagePublisher};
use kafka_mtls_core::consumer::{ChannelSink, ConsumerEngine, DecodedRecord, ShutdownSignal};
use kafka_mtls_core::metrics::ClientMetrics;
use kafka_mtls_core::producer::ProducerLoop;
use kafka_mtls_core::testing::fixtures::{self, test_config};
use kafka_mtls_core::testing::MockBroker;
use kafka_mtls_core::{AppConfig, ConsumerError, CounterMessage};
use tokio::sync::mpsc;

const TOPIC: &str = "timestamps_topic";

async fn start_broker(partitions: usize) -> (MockBroker, AppConfig) {
    let mut broker = MockBroker::new(fixtures::broker_acceptor());
    broker.start().await.unwrap();
    broker.create_topic(TOPIC, partitions).await;
    let config = test_config(&broker.bootstrap(), TOPIC);
    (broker, config)
}

async fn connect(config: &AppConfig) -> Arc<KafkaClient> {
    Arc::new(
        KafkaClient::connect(config, &fixtures::client_channel())
            .await
            .unwrap(),
    )
}

async fn recv(records: &mut mpsc::UnboundedReceiver<DecodedRecord>) -> DecodedRecord {
    tokio::time::timeout(Duration::from_secs(5), records.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("sink closed")
}

#[tokio::test]
async fn test_published_record_is_consumed_from_oldest() {
    let (broker, config) = start_broker(1).await;

    let producer = connect(&config).await;
    let payload = r#"{"timestamp":"2024-01-01T00:00:00Z","count":0}"#;
    producer
        .publish(TOPIC, Bytes::from_static(payload.as_bytes()))
        .await
        .unwrap();

    // a fresh client starts after the record was written
    let consumer = connect(&config).await;
    let (sink, mut records) = ChannelSink::new();
    let engine = ConsumerEngine::new(consumer, TOPIC).with_sink(Arc::new(sink));
    let shutdown = ShutdownSignal::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(&shutdown).await })
    };

    let record = recv(&mut records).await;
    assert_eq!(record.offset, 0);
    assert_eq!(
        record.message,
        CounterMessage {
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            count: 0,
        }
    );

    shutdown.trigger();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.messages_decoded, 1);
    assert!(records.try_recv().is_err());
    assert_eq!(broker.records(TOPIC, 0).await.len(), 1);
}

#[tokio::test]
async fn test_every_partition_gets_a_reader() {
    let (broker, config) = start_broker(3).await;
    for partition in 0..3 {
        let message = CounterMessage::now(i64::from(partition));
        broker.append(TOPIC, partition, message.encode()).await;
    }
    broker.append(TOPIC, 1, "not a counter").await;

    let client = connect(&config).await;
    let metrics = Arc::new(ClientMetrics::new());
    let (sink, mut records) = ChannelSink::new();
    let engine = ConsumerEngine::new(Arc::clone(&client), TOPIC)
        .with_sink(Arc::new(sink))
        .with_metrics(Arc::clone(&metrics));
    let shutdown = ShutdownSignal::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(&shutdown).await })
    };

    let mut seen: Vec<i32> = Vec::new();
    for _ in 0..3 {
        seen.push(recv(&mut records).await.partition);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.messages_malformed.with_label_values(&["1"]).get() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(metrics.readers_active.get(), 3);

    shutdown.trigger();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.readers_started, 3);
    assert_eq!(summary.readers_closed, 3);
    assert_eq!(summary.malformed_messages, 1);
    assert_eq!(metrics.readers_active.get(), 0);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_producer_loop_feeds_consumer() {
    let (_broker, config) = start_broker(2).await;

    let publisher = connect(&config).await;
    let producer = ProducerLoop::new(Arc::clone(&publisher), TOPIC, config.producer.interval());
    let producer_shutdown = ShutdownSignal::new();
    let producer_task = {
        let shutdown = producer_shutdown.clone();
        tokio::spawn(async move { producer.run(&shutdown).await })
    };

    let consumer = connect(&config).await;
    let (sink, mut records) = ChannelSink::new();
    let engine = ConsumerEngine::new(consumer, TOPIC).with_sink(Arc::new(sink));
    let shutdown = ShutdownSignal::new();
    let engine_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(&shutdown).await })
    };

    // partitions interleave, so wait until the first four counts have all arrived
    let mut counts = std::collections::BTreeSet::new();
    while !(0..4).all(|c| counts.contains(&c)) {
        counts.insert(recv(&mut records).await.message.count);
    }

    producer_shutdown.trigger();
    let produced = producer_task.await.unwrap();
    assert!(produced.delivered >= 4);
    assert_eq!(produced.failed, 0);

    shutdown.trigger();
    engine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_topic_is_fatal() {
    let (_broker, config) = start_broker(1).await;
    let client = connect(&config).await;

    let result = ConsumerEngine::new(Arc::clone(&client), "no_such_topic")
        .run(&ShutdownSignal::new())
        .await;
    assert!(matches!(result, Err(ConsumerError::PartitionDiscovery { .. })));
    assert!(client.is_closed());
}
