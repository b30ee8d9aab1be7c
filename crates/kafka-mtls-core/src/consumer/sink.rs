//! Destinations for decoded counter records.

use tokio::sync::mpsc;
use tracing::info;

use crate::message::CounterMessage;

/// Receives every successfully decoded record.
///
/// Called from partition tasks concurrently; ordering holds within a
/// partition only.
pub trait RecordSink: Send + Sync {
    fn record(&self, partition: i32, offset: i64, message: &CounterMessage);
}

/// Logs each record. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn record(&self, partition: i32, offset: i64, message: &CounterMessage) {
        info!(
            partition,
            offset,
            "received timestamp: {}, count: {}",
            message.timestamp,
            message.count
        );
    }
}

/// A record together with where it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub partition: i32,
    pub offset: i64,
    pub message: CounterMessage,
}

/// Forwards records to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DecodedRecord>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DecodedRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RecordSink for ChannelSink {
    fn record(&self, partition: i32, offset: i64, message: &CounterMessage) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(DecodedRecord {
            partition,
            offset,
            message: message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        let message = CounterMessage {
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            count: 7,
        };
        sink.record(2, 41, &message);

        let record = rx.recv().await.unwrap();
        assert_eq!(
            record,
            DecodedRecord {
                partition: 2,
                offset: 41,
                message,
            }
        );
    }

    #[test]
    fn test_channel_sink_without_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.record(0, 0, &CounterMessage::at(chrono::Utc::now(), 1));
    }
}
