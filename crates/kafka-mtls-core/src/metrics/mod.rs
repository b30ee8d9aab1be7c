//! Prometheus metrics for the consumer and producer roles.

pub mod prometheus;

pub use prometheus::ClientMetrics;
