//! Partitioned consumption.
//!
//! [`ConsumerEngine`] reads every partition of a topic concurrently, one
//! task and one reader per partition, and shuts all of them down when the
//! [`ShutdownSignal`] fires.

pub mod engine;
pub mod shutdown;
pub mod sink;

pub use engine::{ConsumerEngine, ConsumerSummary, EngineState};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use sink::{ChannelSink, DecodedRecord, LogSink, RecordSink};
