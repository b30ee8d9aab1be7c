//! Mock Kafka broker for integration testing.
//!
//! A single-node broker that:
//! - Accepts connections only over mutual TLS
//! - Records every request it decodes
//! - Keeps an in-memory log per partition and answers Metadata,
//!   ListOffsets, Fetch and Produce from it
//!
//! Every partition is led by this broker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::fetch_response::{FetchableTopicResponse, PartitionData};
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse, RequestHeader,
    ResponseHeader, TopicName,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, warn};

use crate::broker::protocol::{error_codes, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};
use crate::client::records::{
    decode_batches, encode_batch, encode_control_batch, ProducerRecord,
};
use crate::tls::TlsServerAcceptor;

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Bytes,
    timestamp: i64,
    /// Transaction marker, served as a control batch.
    control: bool,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `records[0]`.
    log_start: i64,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }

    fn append(&mut self, value: Bytes, timestamp: i64) -> i64 {
        self.push(StoredRecord {
            value,
            timestamp,
            control: false,
        })
    }

    fn push(&mut self, record: StoredRecord) -> i64 {
        let offset = self.high_watermark();
        self.records.push(record);
        offset
    }

    /// Encode everything from `offset` to the end, one batch per run of data
    /// records and one control batch per marker.
    fn encode_from(&self, offset: i64) -> Bytes {
        let first = (offset - self.log_start) as usize;
        let mut out = BytesMut::new();
        let mut run: Vec<ProducerRecord> = Vec::new();
        let mut run_start = offset;

        for (i, record) in self.records[first..].iter().enumerate() {
            let record_offset = offset + i as i64;
            if record.control {
                if !run.is_empty() {
                    out.extend_from_slice(&encode_batch(run_start, &run));
                    run.clear();
                }
                out.extend_from_slice(&encode_control_batch(record_offset, record.timestamp));
                run_start = record_offset + 1;
            } else {
                run.push(ProducerRecord::new(record.value.clone(), record.timestamp));
            }
        }
        if !run.is_empty() {
            out.extend_from_slice(&encode_batch(run_start, &run));
        }
        out.freeze()
    }
}

#[derive(Default)]
struct BrokerState {
    topics: RwLock<HashMap<String, Vec<PartitionLog>>>,
    call_log: RwLock<Vec<BrokerCall>>,
    /// Pending error codes to answer fetches with, per partition.
    fetch_errors: Mutex<HashMap<(String, i32), (i16, u32)>>,
    appended: Notify,
    handshake_failures: AtomicUsize,
    connections: AtomicUsize,
}

/// Mock Kafka broker for testing.
pub struct MockBroker {
    node_id: i32,
    acceptor: TlsServerAcceptor,
    state: Arc<BrokerState>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl MockBroker {
    /// Create a broker that terminates TLS with `acceptor`.
    #[must_use]
    pub fn new(acceptor: TlsServerAcceptor) -> Self {
        Self {
            node_id: 1,
            acceptor,
            state: Arc::new(BrokerState::default()),
            local_addr: None,
            shutdown_tx: None,
        }
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: i32) -> Self {
        self.node_id = node_id;
        self
    }

    /// Bind to an ephemeral port on 127.0.0.1 and start serving.
    ///
    /// Returns the bound address, which is also what Metadata advertises.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn start(&mut self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let acceptor = self.acceptor.clone();
        let state = Arc::clone(&self.state);
        let node_id = self.node_id;
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, peer)) = result else { break };
                        let acceptor = acceptor.clone();
                        let state = Arc::clone(&state);
                        let shutdown_rx = shutdown_tx.subscribe();

                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls) => {
                                    state.connections.fetch_add(1, Ordering::SeqCst);
                                    let ctx = Responder { node_id, local_addr, state };
                                    ctx.serve(tls, shutdown_rx).await;
                                }
                                Err(e) => {
                                    debug!(%peer, error = %e, "mock broker rejected handshake");
                                    state.handshake_failures.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every open connection.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// `host:port` for use as a bootstrap server.
    ///
    /// # Panics
    ///
    /// Panics if the broker has not been started.
    #[must_use]
    pub fn bootstrap(&self) -> String {
        self.local_addr
            .expect("mock broker not started")
            .to_string()
    }

    /// Create a topic with empty partitions.
    pub async fn create_topic(&self, topic: &str, partitions: usize) {
        let logs = (0..partitions).map(|_| PartitionLog::default()).collect();
        self.state.topics.write().await.insert(topic.to_string(), logs);
    }

    /// Append a record and return its offset.
    ///
    /// # Panics
    ///
    /// Panics if the topic or partition does not exist.
    pub async fn append(&self, topic: &str, partition: i32, value: impl Into<Bytes>) -> i64 {
        let offset = {
            let mut topics = self.state.topics.write().await;
            let log = topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
                .expect("unknown topic or partition");
            log.append(value.into(), chrono::Utc::now().timestamp_millis())
        };
        self.state.appended.notify_waiters();
        offset
    }

    /// Append a transaction commit marker and return its offset.
    ///
    /// Markers occupy an offset but are never delivered as records.
    ///
    /// # Panics
    ///
    /// Panics if the topic or partition does not exist.
    pub async fn append_control_marker(&self, topic: &str, partition: i32) -> i64 {
        let offset = {
            let mut topics = self.state.topics.write().await;
            let log = topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
                .expect("unknown topic or partition");
            log.push(StoredRecord {
                value: Bytes::new(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                control: true,
            })
        };
        self.state.appended.notify_waiters();
        offset
    }

    /// Drop every record before `offset`, as retention would.
    pub async fn truncate_before(&self, topic: &str, partition: i32, offset: i64) {
        let mut topics = self.state.topics.write().await;
        if let Some(log) = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
        {
            let drop = (offset - log.log_start).clamp(0, log.records.len() as i64) as usize;
            log.records.drain(..drop);
            log.log_start += drop as i64;
        }
    }

    /// Answer the next `times` fetches for a partition with `code`.
    pub async fn inject_fetch_errors(&self, topic: &str, partition: i32, code: i16, times: u32) {
        self.state
            .fetch_errors
            .lock()
            .await
            .insert((topic.to_string(), partition), (code, times));
    }

    /// Data record values currently stored in a partition, oldest first.
    pub async fn records(&self, topic: &str, partition: i32) -> Vec<Bytes> {
        self.state
            .topics
            .read()
            .await
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map(|log| {
                log.records
                    .iter()
                    .filter(|r| !r.control)
                    .map(|r| r.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.state.call_log.read().await.clone()
    }

    pub async fn get_calls_for_api(&self, api_key: ApiKey) -> Vec<BrokerCall> {
        let key = api_key as i16;
        self.state
            .call_log
            .read()
            .await
            .iter()
            .filter(|c| c.api_key == key)
            .cloned()
            .collect()
    }

    /// Handshakes that failed, e.g. because the client certificate was not
    /// trusted.
    #[must_use]
    pub fn handshake_failures(&self) -> usize {
        self.state.handshake_failures.load(Ordering::SeqCst)
    }

    /// Connections that completed the TLS handshake.
    #[must_use]
    pub fn accepted_connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

/// Per-connection request handling.
struct Responder {
    node_id: i32,
    local_addr: SocketAddr,
    state: Arc<BrokerState>,
}

fn topic_name(topic: &str) -> TopicName {
    TopicName::from(StrBytes::from_string(topic.to_string()))
}

fn encode_response<R: Encodable + HeaderVersion>(
    correlation_id: i32,
    version: i16,
    response: &R,
) -> anyhow::Result<Bytes> {
    let mut header = ResponseHeader::default();
    header.correlation_id = correlation_id;

    let mut buf = BytesMut::new();
    header.encode(&mut buf, R::header_version(version))?;
    response.encode(&mut buf, version)?;
    Ok(buf.freeze())
}

impl Responder {
    async fn serve<S>(&self, mut stream: S, mut shutdown_rx: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = read_frame(&mut stream) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) | Err(_) => break,
                },
            };

            let response = match self.handle(frame).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "mock broker could not handle request");
                    break;
                }
            };
            if write_frame(&mut stream, &response).await.is_err() {
                break;
            }
        }
        let _ = stream.shutdown().await;
    }

    async fn handle(&self, mut frame: Bytes) -> anyhow::Result<Bytes> {
        if frame.len() < 4 {
            anyhow::bail!("request too short");
        }
        let api_key = i16::from_be_bytes([frame[0], frame[1]]);
        let api_version = i16::from_be_bytes([frame[2], frame[3]]);

        let header_version = match ApiKey::try_from(api_key) {
            Ok(ApiKey::Metadata) => MetadataRequest::header_version(api_version),
            Ok(ApiKey::ListOffsets) => ListOffsetsRequest::header_version(api_version),
            Ok(ApiKey::Fetch) => FetchRequest::header_version(api_version),
            Ok(ApiKey::Produce) => ProduceRequest::header_version(api_version),
            _ => anyhow::bail!("unsupported api key {api_key}"),
        };
        let header = RequestHeader::decode(&mut frame, header_version)?;

        self.state.call_log.write().await.push(BrokerCall {
            api_key,
            api_version,
            correlation_id: header.correlation_id,
            client_id: header.client_id.as_ref().map(ToString::to_string),
        });

        let correlation_id = header.correlation_id;
        match ApiKey::try_from(api_key) {
            Ok(ApiKey::Metadata) => {
                let request = MetadataRequest::decode(&mut frame, api_version)?;
                let response = self.metadata(&request).await;
                encode_response(correlation_id, api_version, &response)
            }
            Ok(ApiKey::ListOffsets) => {
                let request = ListOffsetsRequest::decode(&mut frame, api_version)?;
                let response = self.list_offsets(&request).await;
                encode_response(correlation_id, api_version, &response)
            }
            Ok(ApiKey::Fetch) => {
                let request = FetchRequest::decode(&mut frame, api_version)?;
                let response = self.fetch(&request).await;
                encode_response(correlation_id, api_version, &response)
            }
            _ => {
                let request = ProduceRequest::decode(&mut frame, api_version)?;
                let response = self.produce(&request).await;
                encode_response(correlation_id, api_version, &response)
            }
        }
    }

    async fn metadata(&self, request: &MetadataRequest) -> MetadataResponse {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(self.node_id);
        broker.host = StrBytes::from_string(self.local_addr.ip().to_string());
        broker.port = i32::from(self.local_addr.port());

        let topics = self.state.topics.read().await;
        let requested: Vec<String> = match &request.topics {
            Some(list) => list
                .iter()
                .filter_map(|t| t.name.as_ref().map(|n| n.to_string()))
                .collect(),
            None => topics.keys().cloned().collect(),
        };

        let mut response = MetadataResponse::default();
        response.brokers = vec![broker];
        response.controller_id = BrokerId(self.node_id);

        for name in requested {
            let mut topic = MetadataResponseTopic::default();
            topic.name = Some(topic_name(&name));
            match topics.get(&name) {
                Some(logs) => {
                    for index in 0..logs.len() {
                        let mut partition = MetadataResponsePartition::default();
                        partition.partition_index = index as i32;
                        partition.leader_id = BrokerId(self.node_id);
                        partition.replica_nodes = vec![BrokerId(self.node_id)];
                        partition.isr_nodes = vec![BrokerId(self.node_id)];
                        topic.partitions.push(partition);
                    }
                }
                None => topic.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION,
            }
            response.topics.push(topic);
        }
        response
    }

    async fn list_offsets(&self, request: &ListOffsetsRequest) -> ListOffsetsResponse {
        let topics = self.state.topics.read().await;
        let mut response = ListOffsetsResponse::default();

        for request_topic in &request.topics {
            let name = request_topic.name.to_string();
            let mut topic = ListOffsetsTopicResponse::default();
            topic.name = request_topic.name.clone();

            for request_partition in &request_topic.partitions {
                let mut partition = ListOffsetsPartitionResponse::default();
                partition.partition_index = request_partition.partition_index;
                partition.timestamp = -1;

                let log = topics
                    .get(&name)
                    .and_then(|logs| logs.get(request_partition.partition_index as usize));
                match (log, request_partition.timestamp) {
                    (None, _) => partition.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION,
                    (Some(log), EARLIEST_TIMESTAMP) => partition.offset = log.log_start,
                    (Some(log), LATEST_TIMESTAMP) => partition.offset = log.high_watermark(),
                    // timestamp lookups are not modelled
                    (Some(log), _) => partition.offset = log.log_start,
                }
                topic.partitions.push(partition);
            }
            response.topics.push(topic);
        }
        response
    }

    async fn take_fetch_error(&self, topic: &str, partition: i32) -> Option<i16> {
        let mut pending = self.state.fetch_errors.lock().await;
        let key = (topic.to_string(), partition);
        let (code, remaining) = pending.get_mut(&key)?;
        let code = *code;
        *remaining -= 1;
        if *remaining == 0 {
            pending.remove(&key);
        }
        Some(code)
    }

    async fn fetch(&self, request: &FetchRequest) -> FetchResponse {
        let max_wait = Duration::from_millis(u64::try_from(request.max_wait_ms).unwrap_or(0));
        let mut waited = false;

        loop {
            // registered before reading the log so no append is missed
            let appended = self.state.appended.notified();

            let mut response = FetchResponse::default();
            let mut has_records = false;
            let mut has_errors = false;

            for request_topic in &request.topics {
                let name = request_topic.topic.to_string();
                let mut topic = FetchableTopicResponse::default();
                topic.topic = request_topic.topic.clone();

                for request_partition in &request_topic.partitions {
                    let index = request_partition.partition;
                    let mut data = PartitionData::default();
                    data.partition_index = index;
                    data.preferred_read_replica = BrokerId(-1);

                    if let Some(code) = self.take_fetch_error(&name, index).await {
                        data.error_code = code;
                        has_errors = true;
                        topic.partitions.push(data);
                        continue;
                    }

                    let topics = self.state.topics.read().await;
                    let Some(log) = topics.get(&name).and_then(|logs| logs.get(index as usize))
                    else {
                        data.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION;
                        has_errors = true;
                        topic.partitions.push(data);
                        continue;
                    };

                    data.high_watermark = log.high_watermark();
                    data.last_stable_offset = log.high_watermark();
                    data.log_start_offset = log.log_start;

                    let offset = request_partition.fetch_offset;
                    if offset < log.log_start || offset > log.high_watermark() {
                        data.error_code = error_codes::OFFSET_OUT_OF_RANGE;
                        has_errors = true;
                    } else if offset < log.high_watermark() {
                        data.records = Some(log.encode_from(offset));
                        has_records = true;
                    }
                    topic.partitions.push(data);
                }
                response.responses.push(topic);
            }

            if has_records || has_errors || waited || max_wait.is_zero() {
                return response;
            }
            waited = true;
            let _ = tokio::time::timeout(max_wait, appended).await;
        }
    }

    async fn produce(&self, request: &ProduceRequest) -> ProduceResponse {
        let mut response = ProduceResponse::default();
        let mut appended_any = false;

        {
            let mut topics = self.state.topics.write().await;
            for topic_data in &request.topic_data {
                let name = topic_data.name.to_string();
                let mut topic = TopicProduceResponse::default();
                topic.name = topic_data.name.clone();

                for partition_data in &topic_data.partition_data {
                    let mut partition = PartitionProduceResponse::default();
                    partition.index = partition_data.index;
                    partition.log_append_time_ms = -1;

                    let log = topics
                        .get_mut(&name)
                        .and_then(|logs| logs.get_mut(partition_data.index as usize));
                    let records = partition_data
                        .records
                        .clone()
                        .map(decode_batches)
                        .transpose();

                    match (log, records) {
                        (Some(log), Ok(records)) => {
                            partition.base_offset = log.high_watermark();
                            partition.log_start_offset = log.log_start;
                            for record in records.unwrap_or_default() {
                                log.append(record.value.unwrap_or_default(), record.timestamp);
                                appended_any = true;
                            }
                        }
                        (None, _) => {
                            partition.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION;
                            partition.base_offset = -1;
                        }
                        (Some(_), Err(e)) => {
                            warn!(error = %e, "mock broker rejected produce batch");
                            // CORRUPT_MESSAGE
                            partition.error_code = 2;
                            partition.base_offset = -1;
                        }
                    }
                    topic.partition_responses.push(partition);
                }
                response.responses.push(topic);
            }
        }

        if appended_any {
            self.state.appended.notify_waiters();
        }
        response
    }
}

/// Read a Kafka frame (4-byte length prefix + body).
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Write a Kafka frame (4-byte length prefix + body).
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
    stream.write_all(&buf).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_partition_log_offsets() {
        let mut log = PartitionLog::default();
        assert_eq!(log.append(Bytes::from_static(b"a"), 0), 0);
        assert_eq!(log.append(Bytes::from_static(b"b"), 0), 1);
        assert_eq!(log.high_watermark(), 2);
    }

    #[test]
    fn test_markers_are_served_as_control_batches() {
        let mut log = PartitionLog::default();
        log.append(Bytes::from_static(b"a"), 0);
        log.push(StoredRecord {
            value: Bytes::new(),
            timestamp: 0,
            control: true,
        });
        log.append(Bytes::from_static(b"b"), 0);

        let set = crate::client::records::decode_record_set(log.encode_from(0)).unwrap();
        assert_eq!(
            set.records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(set.next_offset, Some(3));
    }

    #[tokio::test]
    async fn test_append_and_truncate() {
        let broker = MockBroker::new(fixtures::broker_acceptor());
        broker.create_topic("timestamps_topic", 2).await;

        assert_eq!(broker.append("timestamps_topic", 1, "a").await, 0);
        assert_eq!(broker.append("timestamps_topic", 1, "b").await, 1);
        assert_eq!(broker.append("timestamps_topic", 1, "c").await, 2);

        broker.truncate_before("timestamps_topic", 1, 2).await;
        assert_eq!(
            broker.records("timestamps_topic", 1).await,
            vec![Bytes::from_static(b"c")]
        );
        assert!(broker.records("timestamps_topic", 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut broker = MockBroker::new(fixtures::broker_acceptor());
        let addr = broker.start().await.unwrap();
        assert!(addr.port() > 0);
        assert_eq!(broker.bootstrap(), addr.to_string());

        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
        broker.stop().await;
    }
}
