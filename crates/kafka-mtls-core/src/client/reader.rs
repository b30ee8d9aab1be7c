//! Partition reader handle.
//!
//! A reader exposes two streams, messages and errors, fed by whatever
//! drives the partition (a background fetch task for the real client, a
//! script in tests). Closing the reader closes both streams and stops the
//! driver. Closing is idempotent.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ClientError;

use super::ConsumedMessage;

/// Stops whatever feeds a [`PartitionReader`].
#[async_trait]
pub trait ReaderShutdown: Send {
    /// Stop the driver and wait until it has released its resources.
    async fn shutdown(self: Box<Self>);
}

/// Handle to one partition's message and error streams.
pub struct PartitionReader {
    partition: i32,
    messages: mpsc::Receiver<ConsumedMessage>,
    errors: mpsc::Receiver<ClientError>,
    closer: Option<Box<dyn ReaderShutdown>>,
    closed: bool,
}

impl PartitionReader {
    #[must_use]
    pub fn new(
        partition: i32,
        messages: mpsc::Receiver<ConsumedMessage>,
        errors: mpsc::Receiver<ClientError>,
    ) -> Self {
        Self {
            partition,
            messages,
            errors,
            closer: None,
            closed: false,
        }
    }

    /// Attach the hook run on the first [`close`](Self::close).
    #[must_use]
    pub fn with_shutdown(mut self, closer: impl ReaderShutdown + 'static) -> Self {
        self.closer = Some(Box::new(closer));
        self
    }

    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Borrow both streams at once so they can be polled side by side.
    pub fn streams(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<ConsumedMessage>,
        &mut mpsc::Receiver<ClientError>,
    ) {
        (&mut self.messages, &mut self.errors)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close both streams and stop the driver.
    ///
    /// Returns `true` if this call closed the reader and `false` if it was
    /// already closed.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            debug!(partition = self.partition, "reader already closed");
            return false;
        }
        self.closed = true;
        self.messages.close();
        self.errors.close();
        if let Some(closer) = self.closer.take() {
            closer.shutdown().await;
        }
        debug!(partition = self.partition, "reader closed");
        true
    }
}

impl std::fmt::Debug for PartitionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionReader")
            .field("partition", &self.partition)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingShutdown(Arc<AtomicUsize>);

    #[async_trait]
    impl ReaderShutdown for CountingShutdown {
        async fn shutdown(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn message(offset: i64) -> ConsumedMessage {
        ConsumedMessage {
            partition: 0,
            offset,
            key: None,
            value: Bytes::from_static(b"{}"),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_streams_deliver_in_order() {
        let (msg_tx, msg_rx) = mpsc::channel(4);
        let (_err_tx, err_rx) = mpsc::channel(4);
        let mut reader = PartitionReader::new(0, msg_rx, err_rx);

        msg_tx.send(message(0)).await.unwrap();
        msg_tx.send(message(1)).await.unwrap();

        let (messages, _) = reader.streams();
        assert_eq!(messages.recv().await.unwrap().offset, 0);
        assert_eq!(messages.recv().await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (msg_tx, msg_rx) = mpsc::channel(4);
        let (_err_tx, err_rx) = mpsc::channel(4);
        let mut reader = PartitionReader::new(3, msg_rx, err_rx)
            .with_shutdown(CountingShutdown(Arc::clone(&calls)));

        assert!(reader.close().await);
        assert!(!reader.close().await);
        assert!(reader.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // the driver sees the closed stream
        assert!(msg_tx.send(message(0)).await.is_err());
    }
}
