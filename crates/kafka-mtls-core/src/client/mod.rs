//! Kafka client over the mTLS channel.
//!
//! [`KafkaClient`] implements the two interfaces the rest of the crate
//! depends on: [`BrokerClient`] for the partitioned consumer and
//! [`MessagePublisher`] for the producer loop.

pub mod fetcher;
pub mod reader;
pub mod records;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::{ApiKey, ProduceRequest, ProduceResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::broker::protocol::{
    error_codes, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP, PRODUCE_VERSION,
};
use crate::broker::{fetch_topic_metadata, BrokerConnection, BrokerPool, TopicMetadata};
use crate::config::{AppConfig, ConsumerConfig};
use crate::error::{ClientError, Result};
use crate::tls::ChannelConfig;

use fetcher::{list_offset, PartitionFetcher};
pub use reader::{PartitionReader, ReaderShutdown};
use records::{encode_batch, ProducerRecord};

/// Leader acknowledgement only, the usual default for Kafka producers.
const PRODUCE_ACKS: i16 = 1;

/// Where a new reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// The earliest offset still retained by the broker.
    Oldest,
    /// The next offset to be written.
    Newest,
    /// An explicit offset.
    At(i64),
}

/// A message as delivered by a partition reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// Empty for records with a null value.
    pub value: Bytes,
    /// Record timestamp in milliseconds since the epoch.
    pub timestamp: i64,
}

/// Where a published message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Broker operations the partitioned consumer needs.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Partition indexes of `topic` in ascending order.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Open a reader on one partition.
    async fn open_reader(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<PartitionReader>;

    /// Release every broker connection. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Publishes message payloads to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<Delivery>;
}

/// State shared by the client handle and its fetch tasks.
pub(crate) struct ClientInner {
    pool: BrokerPool,
    metadata: DashMap<String, TopicMetadata>,
    pub(crate) consumer: ConsumerConfig,
    produce_timeout_ms: i32,
    next_partition: AtomicUsize,
    closed: AtomicBool,
}

impl ClientInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn refresh_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let conn = self.pool.get_any().await?;
        let snapshot = match fetch_topic_metadata(&conn, topic).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if matches!(e, ClientError::Connection(_) | ClientError::BrokerUnavailable { .. }) {
                    conn.disconnect().await;
                }
                return Err(e);
            }
        };
        self.pool.update_brokers(snapshot.brokers);
        self.metadata
            .insert(topic.to_string(), snapshot.topic.clone());
        Ok(snapshot.topic)
    }

    async fn topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let cached = self.metadata.get(topic).map(|entry| entry.value().clone());
        match cached {
            Some(metadata) => Ok(metadata),
            None => self.refresh_metadata(topic).await,
        }
    }

    pub(crate) fn invalidate_metadata(&self, topic: &str) {
        self.metadata.remove(topic);
    }

    async fn leader_for(&self, topic: &str, partition: i32) -> Result<i32> {
        let metadata = self.topic_metadata(topic).await?;
        if let Some(leader) = metadata.leader(partition) {
            return Ok(leader);
        }

        // leader missing from the cached view; ask again once
        let metadata = self.refresh_metadata(topic).await?;
        if !metadata.partitions.iter().any(|p| p.partition == partition) {
            return Err(ClientError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            });
        }
        metadata.leader(partition).ok_or_else(|| ClientError::Broker {
            topic: topic.to_string(),
            partition,
            code: error_codes::LEADER_NOT_AVAILABLE,
        })
    }

    pub(crate) async fn open_leader_connection(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<BrokerConnection> {
        self.ensure_open()?;
        let leader = self.leader_for(topic, partition).await?;
        self.pool.open_dedicated(leader).await
    }
}

/// Kafka client connected over mutual TLS.
#[derive(Clone)]
pub struct KafkaClient {
    inner: Arc<ClientInner>,
    topic_hint: Arc<str>,
}

impl KafkaClient {
    /// Connect to the first reachable bootstrap broker.
    ///
    /// # Errors
    ///
    /// Returns an error if no bootstrap broker accepts the connection,
    /// including when every handshake is rejected.
    pub async fn connect(config: &AppConfig, channel: &ChannelConfig) -> Result<Self> {
        let pool = BrokerPool::new(config.kafka.clone(), channel.connector());
        pool.connect().await?;

        info!(brokers = ?config.kafka.brokers, "kafka client connected");

        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                metadata: DashMap::new(),
                consumer: config.consumer.clone(),
                produce_timeout_ms: i32::try_from(config.kafka.request_timeout_ms)
                    .unwrap_or(i32::MAX),
                next_partition: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
            topic_hint: Arc::from(config.kafka.topic.as_str()),
        })
    }

    /// The topic named in the configuration this client was built from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic_hint
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current partition layout of a topic, refreshed from the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be fetched or the topic is unknown.
    pub async fn topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        self.inner.ensure_open()?;
        self.inner.refresh_metadata(topic).await
    }

    async fn resolve_start(
        &self,
        conn: &BrokerConnection,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<i64> {
        match start {
            StartOffset::Oldest => list_offset(conn, topic, partition, EARLIEST_TIMESTAMP).await,
            StartOffset::Newest => list_offset(conn, topic, partition, LATEST_TIMESTAMP).await,
            StartOffset::At(offset) => Ok(offset),
        }
    }
}

/// Stops a fetch task and waits for it to disconnect.
struct FetchTaskHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[async_trait]
impl ReaderShutdown for FetchTaskHandle {
    async fn shutdown(self: Box<Self>) {
        let FetchTaskHandle { stop, task } = *self;
        // the task may already have ended on its own
        let _ = stop.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "fetch task ended abnormally");
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        Ok(self.topic_metadata(topic).await?.partition_ids())
    }

    #[instrument(skip(self), fields(topic = %topic))]
    async fn open_reader(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<PartitionReader> {
        let conn = self.inner.open_leader_connection(topic, partition).await?;
        let offset = match self.resolve_start(&conn, topic, partition, start).await {
            Ok(offset) => offset,
            Err(e) => {
                conn.disconnect().await;
                return Err(e);
            }
        };

        let capacity = self.inner.consumer.channel_capacity;
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (err_tx, err_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();

        let fetcher = PartitionFetcher::new(
            Arc::clone(&self.inner),
            topic.to_string(),
            partition,
            conn,
            offset,
            msg_tx,
            err_tx,
        );
        let task = tokio::spawn(fetcher.run(stop_rx));

        debug!(partition, offset, ?start, "opened partition reader");

        Ok(PartitionReader::new(partition, msg_rx, err_rx).with_shutdown(FetchTaskHandle {
            stop: stop_tx,
            task,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("kafka client already closed");
            return Ok(());
        }
        self.inner.pool.disconnect_all().await;
        self.inner.metadata.clear();
        info!("kafka client closed");
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for KafkaClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<Delivery> {
        self.inner.ensure_open()?;

        let metadata = self.inner.topic_metadata(topic).await?;
        let partitions = metadata.partition_ids();
        if partitions.is_empty() {
            return Err(ClientError::TopicNotFound {
                topic: topic.to_string(),
            });
        }
        let slot = self.inner.next_partition.fetch_add(1, Ordering::Relaxed);
        let partition = partitions[slot % partitions.len()];
        let leader = self.inner.leader_for(topic, partition).await?;
        let conn = self.inner.pool.get_broker(leader).await?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let records = encode_batch(0, &[ProducerRecord::new(payload, timestamp)]);

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = partition;
        partition_data.records = Some(records);

        let mut topic_data = TopicProduceData::default();
        topic_data.name = TopicName::from(StrBytes::from_string(topic.to_string()));
        topic_data.partition_data = vec![partition_data];

        let mut request = ProduceRequest::default();
        request.acks = PRODUCE_ACKS;
        request.timeout_ms = self.inner.produce_timeout_ms;
        request.topic_data = vec![topic_data];

        let response: ProduceResponse = match conn
            .call(ApiKey::Produce, PRODUCE_VERSION, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.inner.invalidate_metadata(topic);
                return Err(e);
            }
        };

        let partition_response = response
            .responses
            .iter()
            .filter(|t| t.name.to_string() == topic)
            .flat_map(|t| t.partition_responses.iter())
            .find(|p| p.index == partition)
            .ok_or_else(|| ClientError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;

        if partition_response.error_code != error_codes::NONE {
            if error_codes::is_stale_leader(partition_response.error_code) {
                self.inner.invalidate_metadata(topic);
            }
            return Err(ClientError::Broker {
                topic: topic.to_string(),
                partition,
                code: partition_response.error_code,
            });
        }

        Ok(Delivery {
            partition,
            offset: partition_response.base_offset,
        })
    }
}
