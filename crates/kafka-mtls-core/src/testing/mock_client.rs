//! Scripted stand-ins for the broker client and publisher.
//!
//! [`MockClient`] hands out readers whose streams are pre-loaded from a
//! per-partition script and records every open and close, so engine tests
//! can assert on lifecycle ordering without a broker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::client::{
    BrokerClient, ConsumedMessage, Delivery, MessagePublisher, PartitionReader, ReaderShutdown,
    StartOffset,
};
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ReaderOpened(i32),
    ReaderClosed(i32),
    ClientClosed,
}

#[derive(Debug, Default, Clone)]
struct PartitionScript {
    messages: Vec<Bytes>,
    errors: u32,
    fail_open: bool,
    end_streams: bool,
}

type EventLog = Arc<Mutex<Vec<ClientEvent>>>;

fn push_event(log: &EventLog, event: ClientEvent) {
    if let Ok(mut events) = log.lock() {
        events.push(event);
    }
}

/// Broker client driven by a script.
#[derive(Debug, Default)]
pub struct MockClient {
    scripts: BTreeMap<i32, PartitionScript>,
    fail_partitions: bool,
    events: EventLog,
    closes: AtomicUsize,
}

impl MockClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty partition.
    #[must_use]
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.scripts.entry(partition).or_default();
        self
    }

    /// Queue a payload on a partition's message stream.
    #[must_use]
    pub fn with_message(mut self, partition: i32, payload: impl Into<Bytes>) -> Self {
        self.scripts
            .entry(partition)
            .or_default()
            .messages
            .push(payload.into());
        self
    }

    /// Queue `count` errors on a partition's error stream.
    #[must_use]
    pub fn with_errors(mut self, partition: i32, count: u32) -> Self {
        self.scripts.entry(partition).or_default().errors += count;
        self
    }

    /// Make opening this partition's reader fail.
    #[must_use]
    pub fn fail_open(mut self, partition: i32) -> Self {
        self.scripts.entry(partition).or_default().fail_open = true;
        self
    }

    /// Close both streams once the script has been delivered.
    #[must_use]
    pub fn end_streams(mut self, partition: i32) -> Self {
        self.scripts.entry(partition).or_default().end_streams = true;
        self
    }

    /// Make partition discovery fail.
    #[must_use]
    pub fn fail_partitions(mut self) -> Self {
        self.fail_partitions = true;
        self
    }

    /// Everything that happened, in order.
    #[must_use]
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct ScriptedShutdown {
    partition: i32,
    events: EventLog,
    // held so the streams stay open until the reader is closed
    _senders: Option<(mpsc::Sender<ConsumedMessage>, mpsc::Sender<ClientError>)>,
}

#[async_trait]
impl ReaderShutdown for ScriptedShutdown {
    async fn shutdown(self: Box<Self>) {
        push_event(&self.events, ClientEvent::ReaderClosed(self.partition));
    }
}

#[async_trait]
impl BrokerClient for MockClient {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        if self.fail_partitions {
            return Err(ClientError::TopicNotFound {
                topic: topic.to_string(),
            });
        }
        Ok(self.scripts.keys().copied().collect())
    }

    async fn open_reader(
        &self,
        topic: &str,
        partition: i32,
        _start: StartOffset,
    ) -> Result<PartitionReader> {
        let script = self
            .scripts
            .get(&partition)
            .cloned()
            .ok_or_else(|| ClientError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;
        if script.fail_open {
            return Err(ClientError::BrokerUnavailable {
                broker_id: 1,
                message: "scripted open failure".to_string(),
            });
        }

        let capacity = script.messages.len() + script.errors as usize + 1;
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (err_tx, err_rx) = mpsc::channel(capacity);

        for (offset, value) in script.messages.into_iter().enumerate() {
            let _ = msg_tx.try_send(ConsumedMessage {
                partition,
                offset: offset as i64,
                key: None,
                value,
                timestamp: 0,
            });
        }
        for _ in 0..script.errors {
            let _ = err_tx.try_send(ClientError::BrokerUnavailable {
                broker_id: 1,
                message: "scripted stream error".to_string(),
            });
        }

        push_event(&self.events, ClientEvent::ReaderOpened(partition));
        let senders = (!script.end_streams).then_some((msg_tx, err_tx));
        Ok(
            PartitionReader::new(partition, msg_rx, err_rx).with_shutdown(ScriptedShutdown {
                partition,
                events: Arc::clone(&self.events),
                _senders: senders,
            }),
        )
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        push_event(&self.events, ClientEvent::ClientClosed);
        Ok(())
    }
}

/// Publisher that records payloads and can fail on request.
#[derive(Debug, Default)]
pub struct MockPublisher {
    published: Mutex<Vec<(String, Bytes)>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` publishes.
    #[must_use]
    pub fn fail_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Successfully published `(topic, payload)` pairs.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagePublisher for MockPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<Delivery> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::BrokerUnavailable {
                broker_id: 1,
                message: "scripted publish failure".to_string(),
            });
        }

        let mut published = self
            .published
            .lock()
            .map_err(|_| ClientError::Closed)?;
        let offset = published.len() as i64;
        published.push((topic.to_string(), payload));
        Ok(Delivery {
            partition: 0,
            offset,
        })
    }
}
