//! Configuration types for the mTLS producer and consumer.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! section is optional; a missing file or an empty document yields the
//! defaults below.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration shared by both roles.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Kafka cluster connection configuration.
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Client identity and trust store locations.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Producer loop settings.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Partitioned consumer settings.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kafka cluster connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Bootstrap broker addresses in `host:port` form.
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Topic produced to and consumed from.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Client id sent in every request header.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Connection timeout in milliseconds (TCP connect plus TLS handshake).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl KafkaConfig {
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse every bootstrap address into host and port.
    ///
    /// # Errors
    ///
    /// Returns an error if an address is not `host:port`.
    pub fn broker_addresses(&self) -> ConfigResult<Vec<(String, u16)>> {
        self.brokers.iter().map(|addr| parse_address(addr)).collect()
    }
}

/// Locations and passwords of the two PKCS#12 bundles.
///
/// The identity (keystore) and trust (truststore) bundles are separate
/// files with separate passwords so either can be rotated on its own.
#[derive(Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Directory holding both bundles.
    #[serde(default = "default_tls_directory")]
    pub directory: PathBuf,

    /// Client identity bundle file name.
    #[serde(default = "default_keystore_filename")]
    pub keystore_filename: String,

    /// Password for the identity bundle.
    /// Supports environment variable expansion: "${KEYSTORE_PASSWORD}"
    #[serde(default = "default_bundle_password")]
    pub keystore_password: String,

    /// Trust anchor bundle file name.
    #[serde(default = "default_truststore_filename")]
    pub truststore_filename: String,

    /// Password for the trust bundle.
    /// Supports environment variable expansion: "${TRUSTSTORE_PASSWORD}"
    #[serde(default = "default_bundle_password")]
    pub truststore_password: String,
}

impl TlsConfig {
    #[must_use]
    pub fn keystore_path(&self) -> PathBuf {
        self.directory.join(&self.keystore_filename)
    }

    #[must_use]
    pub fn truststore_path(&self) -> PathBuf {
        self.directory.join(&self.truststore_filename)
    }

    /// Get the keystore password with environment variables expanded.
    #[must_use]
    pub fn keystore_password(&self) -> String {
        expand_env_vars(&self.keystore_password)
    }

    /// Get the truststore password with environment variables expanded.
    #[must_use]
    pub fn truststore_password(&self) -> String {
        expand_env_vars(&self.truststore_password)
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("directory", &self.directory)
            .field("keystore_filename", &self.keystore_filename)
            .field("keystore_password", &"<redacted>")
            .field("truststore_filename", &self.truststore_filename)
            .field("truststore_password", &"<redacted>")
            .finish()
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Producer loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Delay between two published messages, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl ProducerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Partitioned consumer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Maximum time the broker may hold a fetch waiting for data.
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: i32,

    /// Minimum bytes the broker should accumulate before answering a fetch.
    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: i32,

    /// Upper bound on the bytes returned for one partition per fetch.
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,

    /// Buffer size of each reader's message and error streams.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Close a reader after this many stream errors in a row.
    /// Unset means a reader is never closed because of errors.
    #[serde(default)]
    pub max_consecutive_errors: Option<u32>,

    /// Initial delay after a failed fetch.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Ceiling for the exponential fetch backoff.
    #[serde(default = "default_max_error_backoff_ms")]
    pub max_error_backoff_ms: u64,
}

impl ConsumerConfig {
    #[must_use]
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    #[must_use]
    pub fn max_error_backoff(&self) -> Duration {
        Duration::from_millis(self.max_error_backoff_ms)
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_brokers() -> Vec<String> {
    vec!["localhost:9094".to_string()]
}

fn default_topic() -> String {
    "timestamps_topic".to_string()
}

fn default_client_id() -> String {
    "kafka-mtls".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_tls_directory() -> PathBuf {
    PathBuf::from("../kafka-client")
}

fn default_keystore_filename() -> String {
    "client.p12".to_string()
}

fn default_truststore_filename() -> String {
    "truststore.p12".to_string()
}

fn default_bundle_password() -> String {
    "secret".to_string()
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_fetch_max_wait_ms() -> i32 {
    500
}

fn default_fetch_min_bytes() -> i32 {
    1
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024
}

fn default_channel_capacity() -> usize {
    256
}

fn default_error_backoff_ms() -> u64 {
    100
}

fn default_max_error_backoff_ms() -> u64 {
    5_000
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic: default_topic(),
            client_id: default_client_id(),
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            directory: default_tls_directory(),
            keystore_filename: default_keystore_filename(),
            keystore_password: default_bundle_password(),
            truststore_filename: default_truststore_filename(),
            truststore_password: default_bundle_password(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            fetch_min_bytes: default_fetch_min_bytes(),
            fetch_max_bytes: default_fetch_max_bytes(),
            channel_capacity: default_channel_capacity(),
            max_consecutive_errors: None,
            error_backoff_ms: default_error_backoff_ms(),
            max_error_backoff_ms: default_max_error_backoff_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Parse a `host:port` address.
///
/// # Errors
///
/// Returns an error if the port is missing or not a valid `u16`.
pub fn parse_address(addr: &str) -> ConfigResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

// Configuration loading and validation

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.kafka.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        self.kafka.broker_addresses()?;

        if self.kafka.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }

        if self.producer.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "producer.interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }

        self.consumer.validate()
    }
}

impl ConsumerConfig {
    /// Validate the consumer settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `fetch_max_bytes` is not positive
    /// - `channel_capacity` is zero
    /// - `max_consecutive_errors` is set to zero
    /// - `max_error_backoff_ms` is below `error_backoff_ms`
    pub fn validate(&self) -> ConfigResult<()> {
        if self.fetch_max_bytes <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.fetch_max_bytes",
                message: format!("must be positive, got {}", self.fetch_max_bytes),
            });
        }

        // tokio mpsc panics on a zero capacity
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.channel_capacity",
                message: "must be greater than zero".to_string(),
            });
        }

        if self.max_consecutive_errors == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "consumer.max_consecutive_errors",
                message: "must be at least 1 when set".to_string(),
            });
        }

        if self.max_error_backoff_ms < self.error_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "consumer.max_error_backoff_ms",
                message: format!(
                    "{} is below error_backoff_ms {}",
                    self.max_error_backoff_ms, self.error_backoff_ms
                ),
            });
        }

        Ok(())
    }
}
