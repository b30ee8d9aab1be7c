//! Test utilities.
//!
//! - [`MockBroker`] - an mTLS Kafka broker with in-memory partition logs
//! - [`MockClient`] / [`MockPublisher`] - scripted client-side stand-ins
//! - [`fixtures`] - PKCS#12 archives and test configurations
//!
//! Available when compiling tests or with the `testing` feature.

pub mod fixtures;
pub mod mock_broker;
pub mod mock_client;

pub use mock_broker::{BrokerCall, MockBroker};
pub use mock_client::{ClientEvent, MockClient, MockPublisher};
