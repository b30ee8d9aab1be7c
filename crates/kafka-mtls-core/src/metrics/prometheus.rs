//! Prometheus counters for partitioned consumption and publishing.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters updated by the consumer engine and the producer loop.
///
/// Per-partition series are labelled with `partition`.
pub struct ClientMetrics {
    pub registry: Registry,

    /// Messages handed to the decoder.
    pub messages_received: IntCounterVec,

    /// Messages decoded into a counter record.
    pub messages_decoded: IntCounterVec,

    /// Payloads the decoder rejected.
    pub messages_malformed: IntCounterVec,

    /// Errors reported on reader error streams.
    pub stream_errors: IntCounterVec,

    /// Readers currently open.
    pub readers_active: IntGauge,

    pub messages_published: IntCounter,
    pub publish_errors: IntCounter,
}

impl ClientMetrics {
    /// Create and register every metric.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = partition_counter(
            "kafka_mtls_messages_received_total",
            "Messages received from partition readers",
        );
        let messages_decoded = partition_counter(
            "kafka_mtls_messages_decoded_total",
            "Messages decoded into counter records",
        );
        let messages_malformed = partition_counter(
            "kafka_mtls_messages_malformed_total",
            "Messages skipped because the payload could not be decoded",
        );
        let stream_errors = partition_counter(
            "kafka_mtls_stream_errors_total",
            "Errors reported on partition error streams",
        );

        let readers_active = IntGauge::new(
            "kafka_mtls_readers_active",
            "Partition readers currently open",
        )
        .expect("metric creation should succeed");

        let messages_published = IntCounter::new(
            "kafka_mtls_messages_published_total",
            "Messages acknowledged by the partition leader",
        )
        .expect("metric creation should succeed");

        let publish_errors = IntCounter::new(
            "kafka_mtls_publish_errors_total",
            "Publish attempts that failed",
        )
        .expect("metric creation should succeed");

        for collector in [
            &messages_received,
            &messages_decoded,
            &messages_malformed,
            &stream_errors,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("metric registration should succeed");
        }
        registry
            .register(Box::new(readers_active.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_published.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_errors.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            messages_received,
            messages_decoded,
            messages_malformed,
            stream_errors,
            readers_active,
            messages_published,
            publish_errors,
        }
    }

    pub fn record_received(&self, partition: i32) {
        let label = partition.to_string();
        self.messages_received.with_label_values(&[label.as_str()]).inc();
    }

    pub fn record_decoded(&self, partition: i32) {
        let label = partition.to_string();
        self.messages_decoded.with_label_values(&[label.as_str()]).inc();
    }

    pub fn record_malformed(&self, partition: i32) {
        let label = partition.to_string();
        self.messages_malformed.with_label_values(&[label.as_str()]).inc();
    }

    pub fn record_stream_error(&self, partition: i32) {
        let label = partition.to_string();
        self.stream_errors.with_label_values(&[label.as_str()]).inc();
    }

    pub fn reader_opened(&self) {
        self.readers_active.inc();
    }

    pub fn reader_closed(&self) {
        self.readers_active.dec();
    }

    pub fn record_published(&self) {
        self.messages_published.inc();
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_counter(name: &str, help: &str) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), &["partition"])
        .expect("metric creation should succeed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ClientMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_partition_counters() {
        let metrics = ClientMetrics::new();
        metrics.record_received(0);
        metrics.record_received(0);
        metrics.record_decoded(0);
        metrics.record_malformed(2);
        metrics.record_stream_error(1);

        assert_eq!(metrics.messages_received.with_label_values(&["0"]).get(), 2);
        assert_eq!(metrics.messages_malformed.with_label_values(&["2"]).get(), 1);

        let output = metrics.encode().unwrap();
        assert!(output.contains("kafka_mtls_messages_received_total{partition=\"0\"} 2"));
        assert!(output.contains("kafka_mtls_stream_errors_total"));
    }

    #[test]
    fn test_reader_gauge() {
        let metrics = ClientMetrics::new();
        metrics.reader_opened();
        metrics.reader_opened();
        metrics.reader_closed();
        assert_eq!(metrics.readers_active.get(), 1);
    }

    #[test]
    fn test_publish_counters() {
        let metrics = ClientMetrics::new();
        metrics.record_published();
        metrics.record_publish_error();

        let output = metrics.encode().unwrap();
        assert!(output.contains("kafka_mtls_messages_published_total 1"));
        assert!(output.contains("kafka_mtls_publish_errors_total 1"));
    }
}
