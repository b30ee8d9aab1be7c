//! The partitioned consumption engine.
//!
//! Lifecycle: `Starting → Running → Draining → Closed`.
//!
//! - `Starting` resolves the topic's partitions. Failure here is returned
//!   before any task exists.
//! - `Running` has one task per partition. Each task opens a reader at the
//!   oldest retained offset and waits on the next message, the next error
//!   and the shutdown signal with no priority between them.
//! - `Draining` starts when the signal fires. Every task closes its reader
//!   and the coordinator joins all of them.
//! - `Closed` is entered after the broker client has been closed, which
//!   happens exactly once and only after every reader is gone.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::client::{BrokerClient, ConsumedMessage, PartitionReader, StartOffset};
use crate::error::ConsumerError;
use crate::message::CounterMessage;
use crate::metrics::ClientMetrics;

use super::shutdown::{ShutdownListener, ShutdownSignal};
use super::sink::{LogSink, RecordSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Draining,
    Closed,
}

/// Totals for one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub partitions: usize,
    pub readers_started: usize,
    pub readers_closed: usize,
    pub open_failures: usize,
    pub messages_decoded: u64,
    pub malformed_messages: u64,
    pub stream_errors: u64,
    pub readers_escalated: usize,
    pub task_panics: usize,
}

impl ConsumerSummary {
    fn absorb(&mut self, joined: Result<ReaderReport, JoinError>) {
        match joined {
            Ok(report) => {
                self.readers_started += usize::from(report.opened);
                self.readers_closed += usize::from(report.closed);
                self.open_failures += usize::from(report.open_failed);
                self.readers_escalated += usize::from(report.escalated);
                self.messages_decoded += report.decoded;
                self.malformed_messages += report.malformed;
                self.stream_errors += report.errors;
            }
            Err(e) if e.is_panic() => {
                error!(error = %e, "partition task panicked");
                self.task_panics += 1;
            }
            Err(e) => warn!(error = %e, "partition task cancelled"),
        }
    }
}

/// What one partition task did before it ended.
#[derive(Debug, Default)]
struct ReaderReport {
    opened: bool,
    open_failed: bool,
    closed: bool,
    escalated: bool,
    decoded: u64,
    malformed: u64,
    errors: u64,
}

/// Consumes every partition of one topic until shut down.
pub struct ConsumerEngine<C: BrokerClient> {
    client: Arc<C>,
    topic: String,
    sink: Arc<dyn RecordSink>,
    metrics: Option<Arc<ClientMetrics>>,
    max_consecutive_errors: Option<u32>,
    state: watch::Sender<EngineState>,
}

impl<C: BrokerClient> ConsumerEngine<C> {
    /// Create an engine that logs every decoded record.
    pub fn new(client: Arc<C>, topic: impl Into<String>) -> Self {
        let (state, _rx) = watch::channel(EngineState::Starting);
        Self {
            client,
            topic: topic.into(),
            sink: Arc::new(LogSink),
            metrics: None,
            max_consecutive_errors: None,
            state,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Close a reader after this many errors in a row with no message in
    /// between. `None` keeps readers open regardless of errors.
    #[must_use]
    pub fn with_max_consecutive_errors(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_errors = limit.filter(|n| *n > 0);
        self
    }

    /// Watch the engine's lifecycle state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: EngineState) {
        debug!(state = ?next, "consumer state");
        self.state.send_replace(next);
    }

    /// Run until `shutdown` fires and every reader has been released.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::PartitionDiscovery`] if the topic's
    /// partitions cannot be listed and [`ConsumerError::NoPartitions`] if it
    /// has none. The client is closed in both cases.
    pub async fn run(self, shutdown: &ShutdownSignal) -> Result<ConsumerSummary, ConsumerError> {
        self.set_state(EngineState::Starting);

        let partitions = match self.client.partitions(&self.topic).await {
            Ok(partitions) if partitions.is_empty() => {
                self.close_client().await;
                return Err(ConsumerError::NoPartitions {
                    topic: self.topic.clone(),
                });
            }
            Ok(partitions) => partitions,
            Err(source) => {
                self.close_client().await;
                return Err(ConsumerError::PartitionDiscovery {
                    topic: self.topic.clone(),
                    source,
                });
            }
        };

        info!(topic = %self.topic, ?partitions, "starting partition readers");

        let mut tasks = JoinSet::new();
        for &partition in &partitions {
            let task = PartitionTask {
                client: Arc::clone(&self.client),
                topic: self.topic.clone(),
                partition,
                sink: Arc::clone(&self.sink),
                metrics: self.metrics.clone(),
                max_consecutive_errors: self.max_consecutive_errors,
            };
            tasks.spawn(task.run(shutdown.subscribe()));
        }
        self.set_state(EngineState::Running);

        let mut summary = ConsumerSummary {
            partitions: partitions.len(),
            ..ConsumerSummary::default()
        };

        // tasks that end early are reaped while waiting
        let mut listener = shutdown.subscribe();
        loop {
            tokio::select! {
                () = listener.wait() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => summary.absorb(joined),
            }
        }

        info!(remaining = tasks.len(), "shutdown requested, draining readers");
        self.set_state(EngineState::Draining);
        while let Some(joined) = tasks.join_next().await {
            summary.absorb(joined);
        }

        self.close_client().await;
        info!(
            partitions = summary.partitions,
            readers_closed = summary.readers_closed,
            messages_decoded = summary.messages_decoded,
            malformed_messages = summary.malformed_messages,
            stream_errors = summary.stream_errors,
            "consumer closed"
        );
        Ok(summary)
    }

    async fn close_client(&self) {
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "error closing broker client");
        }
        self.set_state(EngineState::Closed);
    }
}

/// Everything one partition task needs.
struct PartitionTask<C: BrokerClient> {
    client: Arc<C>,
    topic: String,
    partition: i32,
    sink: Arc<dyn RecordSink>,
    metrics: Option<Arc<ClientMetrics>>,
    max_consecutive_errors: Option<u32>,
}

impl<C: BrokerClient> PartitionTask<C> {
    async fn run(self, mut shutdown: ShutdownListener) -> ReaderReport {
        let partition = self.partition;
        let mut report = ReaderReport::default();

        let opened = tokio::select! {
            result = self.client.open_reader(&self.topic, partition, StartOffset::Oldest) => result,
            () = shutdown.wait() => {
                debug!(partition, "shutdown before reader opened");
                return report;
            }
        };
        let mut reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                error!(partition, error = %e, "failed to open partition reader");
                report.open_failed = true;
                return report;
            }
        };

        report.opened = true;
        if let Some(metrics) = &self.metrics {
            metrics.reader_opened();
        }
        info!(partition, "partition reader started");

        self.consume(&mut reader, &mut shutdown, &mut report).await;

        report.closed = reader.close().await;
        if let Some(metrics) = &self.metrics {
            metrics.reader_closed();
        }
        info!(partition, "partition reader closed");
        report
    }

    async fn consume(
        &self,
        reader: &mut PartitionReader,
        shutdown: &mut ShutdownListener,
        report: &mut ReaderReport,
    ) {
        let partition = self.partition;
        let (messages, errors) = reader.streams();
        let mut messages_open = true;
        let mut errors_open = true;
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                () = shutdown.wait() => {
                    debug!(partition, "shutdown observed");
                    return;
                }
                next = messages.recv(), if messages_open => match next {
                    Some(message) => {
                        consecutive_errors = 0;
                        self.handle_message(&message, report);
                    }
                    None => messages_open = false,
                },
                next = errors.recv(), if errors_open => match next {
                    Some(e) => {
                        report.errors += 1;
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        if let Some(metrics) = &self.metrics {
                            metrics.record_stream_error(partition);
                        }
                        warn!(partition, consecutive_errors, error = %e, "partition stream error");

                        if self
                            .max_consecutive_errors
                            .is_some_and(|limit| consecutive_errors >= limit)
                        {
                            error!(partition, consecutive_errors, "too many consecutive errors, closing reader");
                            report.escalated = true;
                            return;
                        }
                    }
                    None => errors_open = false,
                },
            }

            if !messages_open && !errors_open {
                debug!(partition, "reader streams ended");
                return;
            }
        }
    }

    fn handle_message(&self, message: &ConsumedMessage, report: &mut ReaderReport) {
        if let Some(metrics) = &self.metrics {
            metrics.record_received(message.partition);
        }

        match CounterMessage::decode(&message.value) {
            Ok(decoded) => {
                report.decoded += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_decoded(message.partition);
                }
                self.sink.record(message.partition, message.offset, &decoded);
            }
            Err(e) => {
                report.malformed += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_malformed(message.partition);
                }
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "skipping malformed message"
                );
            }
        }
    }
}
