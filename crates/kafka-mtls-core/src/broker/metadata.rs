//! Topic metadata discovery.
//!
//! Fetches broker addresses and the partition layout of a topic so readers
//! and the publisher know which broker leads each partition.

use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{ApiKey, MetadataRequest, MetadataResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

use super::connection::BrokerConnection;
use super::pool::BrokerInfo;
use super::protocol::{error_codes, METADATA_VERSION};

/// Partition layout of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    /// Partitions sorted by index.
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    /// Partition indexes in ascending order.
    #[must_use]
    pub fn partition_ids(&self) -> Vec<i32> {
        self.partitions.iter().map(|p| p.partition).collect()
    }

    /// Current leader of a partition, if it has one.
    #[must_use]
    pub fn leader(&self, partition: i32) -> Option<i32> {
        self.partitions
            .iter()
            .find(|p| p.partition == partition)
            .map(|p| p.leader)
            .filter(|leader| *leader >= 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition: i32,
    /// Leader broker ID, -1 while an election is in progress.
    pub leader: i32,
    pub error_code: i16,
}

/// Brokers and the requested topic's layout from one metadata response.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    pub brokers: Vec<BrokerInfo>,
    pub topic: TopicMetadata,
}

pub(crate) fn build_metadata_request(topic: &str) -> MetadataRequest {
    let mut request_topic = MetadataRequestTopic::default();
    request_topic.name = Some(TopicName::from(StrBytes::from_string(topic.to_string())));

    let mut request = MetadataRequest::default();
    request.topics = Some(vec![request_topic]);
    request.allow_auto_topic_creation = false;
    request
}

/// Request metadata for a single topic.
///
/// # Errors
///
/// Returns [`ClientError::TopicNotFound`] if the broker does not know the
/// topic, [`ClientError::Broker`] for other topic-level error codes, or the
/// underlying transport error.
pub async fn fetch_topic_metadata(
    conn: &BrokerConnection,
    topic: &str,
) -> Result<MetadataSnapshot> {
    let request = build_metadata_request(topic);
    let response: MetadataResponse = conn
        .call(ApiKey::Metadata, METADATA_VERSION, &request)
        .await?;
    parse_metadata_response(response, topic)
}

pub(crate) fn parse_metadata_response(
    response: MetadataResponse,
    topic: &str,
) -> Result<MetadataSnapshot> {
    let mut brokers = Vec::with_capacity(response.brokers.len());
    for broker in &response.brokers {
        match u16::try_from(broker.port) {
            Ok(port) => brokers.push(BrokerInfo::new(
                broker.node_id.0,
                broker.host.to_string(),
                port,
            )),
            Err(_) => warn!(
                broker_id = broker.node_id.0,
                port = broker.port,
                "ignoring broker with invalid port"
            ),
        }
    }

    let topic_response = response
        .topics
        .iter()
        .find(|t| t.name.as_ref().is_some_and(|n| n.to_string() == topic))
        .ok_or_else(|| ClientError::TopicNotFound {
            topic: topic.to_string(),
        })?;

    match topic_response.error_code {
        error_codes::NONE => {}
        error_codes::UNKNOWN_TOPIC_OR_PARTITION => {
            return Err(ClientError::TopicNotFound {
                topic: topic.to_string(),
            })
        }
        code => {
            return Err(ClientError::Broker {
                topic: topic.to_string(),
                partition: -1,
                code,
            })
        }
    }

    let mut partitions: Vec<PartitionMetadata> = topic_response
        .partitions
        .iter()
        .map(|p| PartitionMetadata {
            partition: p.partition_index,
            leader: p.leader_id.0,
            error_code: p.error_code,
        })
        .collect();
    partitions.sort_by_key(|p| p.partition);

    debug!(
        topic,
        broker_count = brokers.len(),
        partition_count = partitions.len(),
        "fetched topic metadata"
    );

    Ok(MetadataSnapshot {
        brokers,
        topic: TopicMetadata {
            name: topic.to_string(),
            partitions,
        },
    })
}
