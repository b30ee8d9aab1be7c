//! Domain error types for the mTLS Kafka client.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// No broker addresses were configured.
    #[error("at least one broker address is required")]
    NoBrokers,

    /// The topic name is empty.
    #[error("topic name must not be empty")]
    EmptyTopic,

    /// A numeric setting is out of its valid range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Errors raised while loading credentials or building the TLS channel.
///
/// Every variant is fatal for channel construction; there is no degraded
/// or partially trusted configuration.
#[derive(Error, Debug)]
pub enum TlsError {
    /// A credential file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The PKCS#12 archive could not be decoded (wrong password, truncated
    /// data, unsupported encryption).
    #[error("failed to decode PKCS#12 bundle: {reason}")]
    Decode { reason: String },

    /// The identity bundle holds more than one (or no) private key entry.
    #[error("identity bundle must contain exactly one private key, found {count}")]
    AmbiguousIdentity { count: usize },

    /// The private key entry carries no leaf certificate.
    #[error("identity bundle has a private key but no certificate")]
    MissingCertificate,

    /// The private key does not belong to the leaf certificate.
    #[error("private key does not match the certificate public key")]
    KeyMismatch,

    /// The private key algorithm is not supported.
    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),

    /// A certificate could not be parsed as X.509.
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    /// TLS configuration assembly failed.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// TLS handshake with the peer failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

/// Errors that occur while talking to Kafka brokers.
#[derive(Error, Debug)]
pub enum ClientError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// TLS failure while connecting.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Failed to decode Kafka protocol message.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to encode Kafka protocol message.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// Broker is not available or connection failed.
    #[error("broker {broker_id} unavailable: {message}")]
    BrokerUnavailable { broker_id: i32, message: String },

    /// No brokers available to handle request.
    #[error("no brokers available")]
    NoBrokersAvailable,

    /// Topic was not found in metadata.
    #[error("topic not found: {topic}")]
    TopicNotFound { topic: String },

    /// Partition not present in topic metadata.
    #[error("partition {partition} not found for topic {topic}")]
    PartitionNotFound { topic: String, partition: i32 },

    /// The broker answered with a non-zero error code.
    #[error("broker returned error code {code} for {topic}/{partition}")]
    Broker {
        topic: String,
        partition: i32,
        code: i16,
    },

    /// Request correlation ID mismatch.
    #[error("correlation ID mismatch: expected {expected}, got {actual}")]
    CorrelationIdMismatch { expected: i32, actual: i32 },

    /// Record batch in a format this client does not read.
    #[error("unsupported record format: {0}")]
    UnsupportedRecords(String),

    /// The client has already been closed.
    #[error("client closed")]
    Closed,
}

/// Errors decoding a counter message payload.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Payload is not the expected JSON shape.
    #[error("malformed message payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The timestamp field is not RFC 3339.
    #[error("invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Fatal errors from the partitioned consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Partition discovery failed; the consumer cannot start.
    #[error("failed to get partitions for topic {topic}: {source}")]
    PartitionDiscovery {
        topic: String,
        #[source]
        source: ClientError,
    },

    /// The topic reported no partitions.
    #[error("topic {topic} has no partitions")]
    NoPartitions { topic: String },
}

/// Result type alias for broker client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "producer.interval_ms",
            message: "must be greater than zero".to_string(),
        };
        assert!(err.to_string().contains("producer.interval_ms"));
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::AmbiguousIdentity { count: 2 };
        assert!(err.to_string().contains('2'));
        assert!(TlsError::KeyMismatch.to_string().contains("does not match"));
    }

    #[test]
    fn test_client_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let client_err: ClientError = io_err.into();
        assert!(matches!(client_err, ClientError::Connection(_)));
    }

    #[test]
    fn test_client_error_from_tls() {
        let client_err: ClientError = TlsError::Handshake("bad certificate".to_string()).into();
        assert!(matches!(client_err, ClientError::Tls(_)));
        assert!(client_err.to_string().contains("bad certificate"));
    }

    #[test]
    fn test_consumer_error_display() {
        let err = ConsumerError::PartitionDiscovery {
            topic: "timestamps_topic".to_string(),
            source: ClientError::NoBrokersAvailable,
        };
        assert!(err.to_string().contains("timestamps_topic"));
        assert!(err.to_string().contains("no brokers available"));
    }
}
