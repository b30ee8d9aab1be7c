//! Broker connection management.
//!
//! This module provides:
//! - mTLS connections to Kafka brokers with request/response correlation
//! - A pool of shared per-broker connections plus dedicated reader connections
//! - Topic metadata discovery
//! - The API versions and error codes this client speaks

pub mod connection;
pub mod metadata;
pub mod pool;
pub mod protocol;

pub use connection::BrokerConnection;
pub use metadata::{fetch_topic_metadata, MetadataSnapshot, PartitionMetadata, TopicMetadata};
pub use pool::{BrokerInfo, BrokerPool};
