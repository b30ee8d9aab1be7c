//! Fixed-interval publisher of counter messages.
//!
//! Every tick publishes `{"timestamp": now, "count": n}` and increments `n`
//! whether or not the broker accepted the message. Failures are logged and
//! the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::client::MessagePublisher;
use crate::consumer::ShutdownSignal;
use crate::message::CounterMessage;
use crate::metrics::ClientMetrics;

/// Totals for one producer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
}

pub struct ProducerLoop<P: MessagePublisher> {
    publisher: Arc<P>,
    topic: String,
    interval: Duration,
    metrics: Option<Arc<ClientMetrics>>,
}

impl<P: MessagePublisher> ProducerLoop<P> {
    pub fn new(publisher: Arc<P>, topic: impl Into<String>, interval: Duration) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            interval,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish until `shutdown` fires.
    pub async fn run(&self, shutdown: &ShutdownSignal) -> ProducerSummary {
        let mut listener = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = ProducerSummary::default();
        let mut count: i64 = 0;

        info!(topic = %self.topic, interval_ms = self.interval.as_millis() as u64, "starting to send messages");

        loop {
            tokio::select! {
                () = listener.wait() => break,
                _ = ticker.tick() => {}
            }

            let message = CounterMessage::now(count);
            summary.attempted += 1;

            let publish = self
                .publisher
                .publish(&self.topic, Bytes::from(message.encode()));
            let outcome = tokio::select! {
                () = listener.wait() => break,
                outcome = publish => outcome,
            };

            match outcome {
                Ok(delivery) => {
                    summary.delivered += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_published();
                    }
                    info!(
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "message {count} delivered to partition {} at offset {}: {}",
                        delivery.partition,
                        delivery.offset,
                        message.timestamp
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_publish_error();
                    }
                    error!(count, error = %e, "failed to deliver message {count}");
                }
            }
            count += 1;
        }

        info!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            failed = summary.failed,
            "producer stopped"
        );
        summary
    }
}
