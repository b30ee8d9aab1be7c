//! Per-partition fetch loop.
//!
//! Each partition reader is fed by one background task that owns a
//! dedicated connection to the partition leader and long-polls it with
//! Fetch requests. Failures are reported on the reader's error stream and
//! retried with a bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    TopicName,
};
use kafka_protocol::protocol::StrBytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::protocol::{
    error_codes, CONSUMER_REPLICA_ID, EARLIEST_TIMESTAMP, FETCH_VERSION, LIST_OFFSETS_VERSION,
};
use crate::broker::BrokerConnection;
use crate::config::ConsumerConfig;
use crate::error::{ClientError, Result};

use super::records::{decode_record_set, RecordSet};
use super::{ClientInner, ConsumedMessage};

/// Exponential backoff between failed fetches.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn topic_name(topic: &str) -> TopicName {
    TopicName::from(StrBytes::from_string(topic.to_string()))
}

/// Resolve a ListOffsets timestamp (-2 earliest, -1 latest) to an offset.
///
/// # Errors
///
/// Returns [`ClientError::Broker`] for a partition-level error code, or the
/// transport error.
pub(crate) async fn list_offset(
    conn: &BrokerConnection,
    topic: &str,
    partition: i32,
    timestamp: i64,
) -> Result<i64> {
    let mut request_partition = ListOffsetsPartition::default();
    request_partition.partition_index = partition;
    request_partition.current_leader_epoch = -1;
    request_partition.timestamp = timestamp;

    let mut request_topic = ListOffsetsTopic::default();
    request_topic.name = topic_name(topic);
    request_topic.partitions = vec![request_partition];

    let mut request = ListOffsetsRequest::default();
    request.replica_id = BrokerId(CONSUMER_REPLICA_ID);
    request.isolation_level = 0;
    request.topics = vec![request_topic];

    let response: ListOffsetsResponse = conn
        .call(ApiKey::ListOffsets, LIST_OFFSETS_VERSION, &request)
        .await?;

    let partition_response = response
        .topics
        .iter()
        .filter(|t| t.name.to_string() == topic)
        .flat_map(|t| t.partitions.iter())
        .find(|p| p.partition_index == partition)
        .ok_or_else(|| ClientError::PartitionNotFound {
            topic: topic.to_string(),
            partition,
        })?;

    if partition_response.error_code != error_codes::NONE {
        return Err(ClientError::Broker {
            topic: topic.to_string(),
            partition,
            code: partition_response.error_code,
        });
    }

    Ok(partition_response.offset)
}

pub(crate) fn build_fetch_request(
    topic: &str,
    partition: i32,
    offset: i64,
    settings: &ConsumerConfig,
) -> FetchRequest {
    let mut fetch_partition = FetchPartition::default();
    fetch_partition.partition = partition;
    fetch_partition.current_leader_epoch = -1;
    fetch_partition.fetch_offset = offset;
    fetch_partition.log_start_offset = -1;
    fetch_partition.partition_max_bytes = settings.fetch_max_bytes;

    let mut fetch_topic = FetchTopic::default();
    fetch_topic.topic = topic_name(topic);
    fetch_topic.partitions = vec![fetch_partition];

    let mut request = FetchRequest::default();
    request.replica_id = BrokerId(CONSUMER_REPLICA_ID);
    request.max_wait_ms = settings.fetch_max_wait_ms;
    request.min_bytes = settings.fetch_min_bytes;
    request.max_bytes = settings.fetch_max_bytes;
    request.isolation_level = 0;
    request.session_id = 0;
    request.session_epoch = -1;
    request.topics = vec![fetch_topic];
    request
}

/// Issue one Fetch for a single partition and decode its records.
async fn fetch_partition(
    conn: &BrokerConnection,
    topic: &str,
    partition: i32,
    offset: i64,
    settings: &ConsumerConfig,
) -> Result<RecordSet> {
    let request = build_fetch_request(topic, partition, offset, settings);
    let response: FetchResponse = conn.call(ApiKey::Fetch, FETCH_VERSION, &request).await?;

    if response.error_code != error_codes::NONE {
        return Err(ClientError::Broker {
            topic: topic.to_string(),
            partition,
            code: response.error_code,
        });
    }

    let data = response
        .responses
        .into_iter()
        .filter(|t| t.topic.to_string() == topic)
        .flat_map(|t| t.partitions.into_iter())
        .find(|p| p.partition_index == partition)
        .ok_or_else(|| ClientError::PartitionNotFound {
            topic: topic.to_string(),
            partition,
        })?;

    if data.error_code != error_codes::NONE {
        return Err(ClientError::Broker {
            topic: topic.to_string(),
            partition,
            code: data.error_code,
        });
    }

    match data.records {
        Some(records) => decode_record_set(records),
        None => Ok(RecordSet::default()),
    }
}

/// Background task feeding one partition reader.
pub(crate) struct PartitionFetcher {
    inner: Arc<ClientInner>,
    topic: String,
    partition: i32,
    conn: Option<BrokerConnection>,
    next_offset: i64,
    messages: mpsc::Sender<ConsumedMessage>,
    errors: mpsc::Sender<ClientError>,
    backoff: Backoff,
}

impl PartitionFetcher {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        topic: String,
        partition: i32,
        conn: BrokerConnection,
        start_offset: i64,
        messages: mpsc::Sender<ConsumedMessage>,
        errors: mpsc::Sender<ClientError>,
    ) -> Self {
        let backoff = Backoff::new(
            inner.consumer.error_backoff(),
            inner.consumer.max_error_backoff(),
        );
        Self {
            inner,
            topic,
            partition,
            conn: Some(conn),
            next_offset: start_offset,
            messages,
            errors,
            backoff,
        }
    }

    /// Fetch until `stop` fires or the reader drops its streams.
    pub(crate) async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = self.next_offset,
            "fetch loop started"
        );

        loop {
            let outcome = tokio::select! {
                _ = &mut stop => break,
                outcome = self.fetch_once() => outcome,
            };

            match outcome {
                Ok(set) => {
                    self.backoff.reset();
                    if !self.deliver(set, &mut stop).await {
                        break;
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = self.next_offset,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "fetch failed"
                    );
                    self.recover(&e).await;

                    let reported = tokio::select! {
                        _ = &mut stop => break,
                        sent = self.errors.send(e) => sent.is_ok(),
                    };
                    if !reported {
                        break;
                    }

                    tokio::select! {
                        _ = &mut stop => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(conn) = self.conn.take() {
            conn.disconnect().await;
        }
        debug!(topic = %self.topic, partition = self.partition, "fetch loop stopped");
    }

    async fn fetch_once(&mut self) -> Result<RecordSet> {
        if self.conn.is_none() {
            let conn = self
                .inner
                .open_leader_connection(&self.topic, self.partition)
                .await?;
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_ref() else {
            return Err(ClientError::Closed);
        };
        fetch_partition(
            conn,
            &self.topic,
            self.partition,
            self.next_offset,
            &self.inner.consumer,
        )
        .await
    }

    /// Push records at or past the current position to the reader, then
    /// move the position past every complete batch received.
    ///
    /// Returns `false` when the loop should end.
    async fn deliver(&mut self, set: RecordSet, stop: &mut oneshot::Receiver<()>) -> bool {
        for record in set.records {
            // fetches return whole batches, which may start before our position
            if record.offset < self.next_offset {
                continue;
            }
            let offset = record.offset;
            let message = ConsumedMessage {
                partition: self.partition,
                offset,
                key: record.key,
                value: record.value.unwrap_or_default(),
                timestamp: record.timestamp,
            };

            tokio::select! {
                _ = &mut *stop => return false,
                sent = self.messages.send(message) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
            self.next_offset = offset + 1;
        }

        // control markers and compacted gaps carry no records to deliver
        if let Some(end) = set.next_offset.filter(|end| *end > self.next_offset) {
            debug!(
                topic = %self.topic,
                partition = self.partition,
                from = self.next_offset,
                to = end,
                "skipping offsets without records"
            );
            self.next_offset = end;
        }
        true
    }

    /// Adjust connection and position after a failed fetch.
    async fn recover(&mut self, error: &ClientError) {
        match error {
            ClientError::Broker { code, .. } if *code == error_codes::OFFSET_OUT_OF_RANGE => {
                self.reset_to_earliest().await;
            }
            ClientError::Broker { code, .. } if error_codes::is_stale_leader(*code) => {
                self.inner.invalidate_metadata(&self.topic);
                self.drop_connection().await;
            }
            ClientError::Connection(_)
            | ClientError::Tls(_)
            | ClientError::BrokerUnavailable { .. }
            | ClientError::CorrelationIdMismatch { .. }
            | ClientError::ProtocolDecode { .. } => {
                self.drop_connection().await;
            }
            _ => {}
        }
    }

    async fn reset_to_earliest(&mut self) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        match list_offset(conn, &self.topic, self.partition, EARLIEST_TIMESTAMP).await {
            Ok(earliest) => {
                info!(
                    topic = %self.topic,
                    partition = self.partition,
                    from = self.next_offset,
                    to = earliest,
                    "offset out of range, resetting to oldest retained offset"
                );
                self.next_offset = earliest;
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %e,
                    "failed to look up oldest offset"
                );
            }
        }
    }

    async fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_build_fetch_request() {
        let settings = ConsumerConfig::default();
        let request = build_fetch_request("timestamps_topic", 2, 17, &settings);

        assert_eq!(request.replica_id, BrokerId(-1));
        assert_eq!(request.session_epoch, -1);
        assert_eq!(request.max_wait_ms, settings.fetch_max_wait_ms);
        assert_eq!(request.topics.len(), 1);
        assert_eq!(request.topics[0].topic.to_string(), "timestamps_topic");

        let partition = &request.topics[0].partitions[0];
        assert_eq!(partition.partition, 2);
        assert_eq!(partition.fetch_offset, 17);
        assert_eq!(partition.partition_max_bytes, settings.fetch_max_bytes);
    }
}
