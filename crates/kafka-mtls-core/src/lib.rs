//! Kafka over mutual TLS.
//!
//! This library builds a client TLS channel from two PKCS#12 archives and
//! uses it to publish and consume timestamped counter messages.
//!
//! # Architecture
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`tls`] - PKCS#12 decoding and the mTLS channel builder
//! - [`broker`] - Broker connections, connection pool and metadata
//! - [`client`] - Kafka client, partition readers and record batches
//! - [`consumer`] - Partitioned consumption engine and shutdown signal
//! - [`producer`] - Fixed-interval counter publisher
//! - [`message`] - The counter message codec
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kafka_mtls_core::{AppConfig, ChannelConfig, ConsumerEngine, KafkaClient, ShutdownSignal};
//!
//! let config = AppConfig::from_file("config.yaml")?;
//! let channel = ChannelConfig::from_settings(&config.tls)?;
//! let client = Arc::new(KafkaClient::connect(&config, &channel).await?);
//!
//! let shutdown = ShutdownSignal::new();
//! let summary = ConsumerEngine::new(client, &config.kafka.topic)
//!     .run(&shutdown)
//!     .await?;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{BrokerClient, KafkaClient, MessagePublisher, PartitionReader, StartOffset};
pub use config::AppConfig;
pub use consumer::{ConsumerEngine, ConsumerSummary, EngineState, ShutdownSignal};
pub use error::{ClientError, CodecError, ConfigError, ConsumerError, Result, TlsError};
pub use message::CounterMessage;
pub use producer::{ProducerLoop, ProducerSummary};
pub use tls::{build_channel, ChannelConfig};
