//! Kafka mTLS CLI
//!
//! Publishes timestamped counter messages to a topic, or consumes every
//! partition of it, over a mutually authenticated TLS connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_mtls_core::client::BrokerClient;
use kafka_mtls_core::config::{AppConfig, LoggingConfig};
use kafka_mtls_core::metrics::ClientMetrics;
use kafka_mtls_core::{ChannelConfig, ConsumerEngine, KafkaClient, ProducerLoop, ShutdownSignal};

/// Timestamped counter messages over mutually authenticated Kafka.
#[derive(Parser)]
#[command(name = "kafka-mtls")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override broker list (comma separated host:port).
    #[arg(long, value_delimiter = ',')]
    brokers: Option<Vec<String>>,

    /// Override topic.
    #[arg(long)]
    topic: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Clone, Copy)]
enum Role {
    /// Publish a counter message every interval.
    Produce,
    /// Consume all partitions from the oldest retained offset.
    Consume,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = load_config(&args.config)?;

    if let Some(brokers) = args.brokers {
        config.kafka.brokers = brokers;
    }
    if let Some(topic) = args.topic {
        config.kafka.topic = topic;
    }
    config.validate().context("invalid configuration")?;

    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };
    setup_tracing(&log_config);

    if !config_found {
        info!(path = %args.config.display(), "configuration file not found, using defaults");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        brokers = ?config.kafka.brokers,
        topic = %config.kafka.topic,
        "starting kafka-mtls"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match args.role {
            Role::Produce => run_producer(config).await,
            Role::Consume => run_consumer(config).await,
        }
    })
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        AppConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Build the channel and connect. Any failure here is fatal.
async fn connect(config: &AppConfig) -> anyhow::Result<Arc<KafkaClient>> {
    let channel = ChannelConfig::from_settings(&config.tls).with_context(|| {
        format!(
            "failed to build mTLS channel from {}",
            config.tls.directory.display()
        )
    })?;

    info!("connecting to kafka with mTLS");
    let client = KafkaClient::connect(config, &channel)
        .await
        .context("failed to connect to kafka")?;
    info!("successfully connected to kafka with mTLS");

    Ok(Arc::new(client))
}

async fn run_consumer(config: AppConfig) -> anyhow::Result<()> {
    let client = connect(&config).await?;
    let metrics = Arc::new(ClientMetrics::new());
    spawn_metrics_server(&config, &metrics);

    let shutdown = ShutdownSignal::new();
    spawn_signal_handler(shutdown.clone());

    let engine = ConsumerEngine::new(client, config.kafka.topic.clone())
        .with_metrics(metrics)
        .with_max_consecutive_errors(config.consumer.max_consecutive_errors);

    info!(topic = %config.kafka.topic, "waiting for messages");
    // the engine logs "consumer closed" as its final action
    engine.run(&shutdown).await?;
    Ok(())
}

async fn run_producer(config: AppConfig) -> anyhow::Result<()> {
    let client = connect(&config).await?;
    let metrics = Arc::new(ClientMetrics::new());
    spawn_metrics_server(&config, &metrics);

    let shutdown = ShutdownSignal::new();
    spawn_signal_handler(shutdown.clone());

    let producer = ProducerLoop::new(
        Arc::clone(&client),
        config.kafka.topic.clone(),
        config.producer.interval(),
    )
    .with_metrics(metrics);
    producer.run(&shutdown).await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "error closing producer");
    }
    info!("producer closed");
    Ok(())
}

/// Trigger `shutdown` on every SIGINT/SIGTERM. Only the first one counts.
fn spawn_signal_handler(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = shutdown_signal().await {
                // default signal disposition still terminates the process
                error!(error = %e, "failed to listen for shutdown signals");
                return;
            }
            if shutdown.trigger() {
                info!("shutdown signal received, shutting down");
            } else {
                info!("shutdown already in progress");
            }
        }
    });
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}

fn spawn_metrics_server(config: &AppConfig, metrics: &Arc<ClientMetrics>) {
    if !config.metrics.enabled {
        return;
    }
    let metrics = Arc::clone(metrics);
    let address = config.metrics.address.clone();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(&address, metrics).await {
            error!(error = %e, "metrics server error");
        }
    });
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<ClientMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_consume_with_overrides() {
        let args = Args::try_parse_from([
            "kafka-mtls",
            "--brokers",
            "a:9094,b:9094",
            "--topic",
            "other",
            "-vv",
            "consume",
        ])
        .unwrap();
        assert_eq!(
            args.brokers,
            Some(vec!["a:9094".to_string(), "b:9094".to_string()])
        );
        assert_eq!(args.topic.as_deref(), Some("other"));
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.role, Role::Consume));
    }

    #[test]
    fn test_role_is_required() {
        assert!(Args::try_parse_from(["kafka-mtls"]).is_err());
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/kafka-mtls.yaml")).unwrap();
        assert_eq!(config.kafka.topic, "timestamps_topic");
        assert_eq!(config.kafka.brokers, vec!["localhost:9094".to_string()]);
    }
}
