//! PKCS#12 fixtures and ready-made configurations.
//!
//! `truststore.p12` holds the CA that signed `client.p12`, `client-ec.p12`
//! and `broker.p12`. The `rogue-*` archives belong to an unrelated CA.
//! Every archive uses the password [`PASSWORD`].

use std::path::PathBuf;

use crate::config::AppConfig;
use crate::tls::{ChannelConfig, TlsServerAcceptor};

pub const PASSWORD: &str = "secret";

pub const CLIENT_P12: &[u8] = include_bytes!("../../tests/fixtures/client.p12");
pub const CLIENT_EC_P12: &[u8] = include_bytes!("../../tests/fixtures/client-ec.p12");
/// The RSA and EC client identities in a single archive.
pub const CLIENT_TWO_KEYS_P12: &[u8] = include_bytes!("../../tests/fixtures/client-two-keys.p12");
pub const BROKER_P12: &[u8] = include_bytes!("../../tests/fixtures/broker.p12");
pub const TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/truststore.p12");
pub const TRUSTSTORE_DUPLICATES_P12: &[u8] =
    include_bytes!("../../tests/fixtures/truststore-duplicates.p12");
pub const ROGUE_BROKER_P12: &[u8] = include_bytes!("../../tests/fixtures/rogue-broker.p12");
pub const ROGUE_TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/rogue-truststore.p12");

/// Directory holding the fixture files on disk.
#[must_use]
pub fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Channel presenting the RSA client identity and trusting the fixture CA.
///
/// # Panics
///
/// Panics if the fixtures cannot be decoded.
#[must_use]
pub fn client_channel() -> ChannelConfig {
    ChannelConfig::build(CLIENT_P12, PASSWORD, TRUSTSTORE_P12, PASSWORD)
        .expect("client fixtures should build a channel")
}

/// Acceptor presenting the broker identity and requiring fixture-CA clients.
///
/// # Panics
///
/// Panics if the fixtures cannot be decoded.
#[must_use]
pub fn broker_acceptor() -> TlsServerAcceptor {
    TlsServerAcceptor::from_pkcs12(BROKER_P12, PASSWORD, TRUSTSTORE_P12, PASSWORD)
        .expect("broker fixtures should build an acceptor")
}

/// Acceptor signed by the rogue CA that only trusts rogue clients.
///
/// # Panics
///
/// Panics if the fixtures cannot be decoded.
#[must_use]
pub fn rogue_broker_acceptor() -> TlsServerAcceptor {
    TlsServerAcceptor::from_pkcs12(ROGUE_BROKER_P12, PASSWORD, ROGUE_TRUSTSTORE_P12, PASSWORD)
        .expect("rogue fixtures should build an acceptor")
}

/// Configuration pointing at `bootstrap` with the on-disk fixtures and
/// short timeouts suited to tests.
#[must_use]
pub fn test_config(bootstrap: &str, topic: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.kafka.brokers = vec![bootstrap.to_string()];
    config.kafka.topic = topic.to_string();
    config.kafka.connection_timeout_ms = 2_000;
    config.kafka.request_timeout_ms = 5_000;
    config.tls.directory = fixture_dir();
    config.consumer.fetch_max_wait_ms = 50;
    config.consumer.error_backoff_ms = 10;
    config.consumer.max_error_backoff_ms = 50;
    config.producer.interval_ms = 20;
    config
}
