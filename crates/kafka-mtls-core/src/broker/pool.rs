//! Broker connection pool.
//!
//! Tracks the brokers advertised in metadata responses and hands out shared
//! connections to them, opened lazily over the mTLS channel. Partition
//! readers get dedicated connections so long-polling fetches never block
//! metadata or produce traffic.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::{ClientError, Result};
use crate::tls::TlsConnector;

use super::connection::BrokerConnection;

/// Manages connections to Kafka brokers.
pub struct BrokerPool {
    config: KafkaConfig,
    connector: TlsConnector,
    /// Advertised broker addresses indexed by broker ID.
    brokers: DashMap<i32, BrokerInfo>,
    /// Shared connections indexed by broker ID.
    connections: DashMap<i32, Arc<BrokerConnection>>,
    /// Bootstrap connection (broker_id = -1).
    bootstrap: RwLock<Option<Arc<BrokerConnection>>>,
}

impl BrokerPool {
    /// Create a new broker pool.
    #[must_use]
    pub fn new(config: KafkaConfig, connector: TlsConnector) -> Self {
        Self {
            config,
            connector,
            brokers: DashMap::new(),
            connections: DashMap::new(),
            bootstrap: RwLock::new(None),
        }
    }

    /// Connect to the Kafka cluster using the bootstrap servers.
    ///
    /// Tries each bootstrap server in order until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if all bootstrap servers fail, or
    /// [`ClientError::NoBrokersAvailable`] if none are configured.
    pub async fn connect(&self) -> Result<()> {
        let addresses = self
            .config
            .broker_addresses()
            .map_err(|e| ClientError::BrokerUnavailable {
                broker_id: -1,
                message: e.to_string(),
            })?;

        let mut last_error = None;
        for (host, port) in addresses {
            let conn = self.create_connection(-1, host.clone(), port);

            match conn.connect().await {
                Ok(()) => {
                    info!(host = %host, port, "connected to bootstrap server");
                    *self.bootstrap.write().await = Some(Arc::new(conn));
                    return Ok(());
                }
                Err(e) => {
                    warn!(host = %host, port, error = %e, "failed to connect to bootstrap server");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ClientError::NoBrokersAvailable))
    }

    fn create_connection(&self, broker_id: i32, host: String, port: u16) -> BrokerConnection {
        BrokerConnection::new(broker_id, host, port, self.connector.clone())
            .with_timeouts(
                self.config.connection_timeout(),
                self.config.request_timeout(),
            )
            .with_client_id(self.config.client_id.clone())
    }

    fn broker_info(&self, broker_id: i32) -> Result<BrokerInfo> {
        self.brokers
            .get(&broker_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClientError::BrokerUnavailable {
                broker_id,
                message: "broker not in metadata".to_string(),
            })
    }

    /// Get the shared connection to a specific broker, connecting if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unknown or cannot be reached.
    pub async fn get_broker(&self, broker_id: i32) -> Result<Arc<BrokerConnection>> {
        let existing = self
            .connections
            .get(&broker_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(conn) = existing {
            if conn.is_connected().await {
                return Ok(conn);
            }
            debug!(broker_id, "reconnecting to broker");
            conn.connect().await?;
            return Ok(conn);
        }

        let info = self.broker_info(broker_id)?;
        let conn = Arc::new(self.create_connection(broker_id, info.host.clone(), info.port));
        conn.connect().await?;
        info!(broker_id, host = %info.host, port = info.port, "connected to broker");
        self.connections.insert(broker_id, Arc::clone(&conn));
        Ok(conn)
    }

    /// Open a new connection to a broker that the caller owns exclusively.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unknown or cannot be reached.
    pub async fn open_dedicated(&self, broker_id: i32) -> Result<BrokerConnection> {
        let info = self.broker_info(broker_id)?;
        let conn = self.create_connection(broker_id, info.host, info.port);
        conn.connect().await?;
        Ok(conn)
    }

    /// Get any available connection (for metadata requests).
    ///
    /// Prefers the bootstrap connection, falls back to any known broker and
    /// finally reconnects through the bootstrap list.
    ///
    /// # Errors
    ///
    /// Returns an error if no connections are available.
    pub async fn get_any(&self) -> Result<Arc<BrokerConnection>> {
        let bootstrap = self.bootstrap.read().await.clone();
        if let Some(conn) = bootstrap {
            if conn.is_connected().await {
                return Ok(conn);
            }
        }

        let known: Vec<Arc<BrokerConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in known {
            if conn.is_connected().await {
                return Ok(conn);
            }
        }

        self.connect().await?;
        self.bootstrap
            .read()
            .await
            .clone()
            .ok_or(ClientError::NoBrokersAvailable)
    }

    /// Replace the set of known brokers with the ones from a metadata response.
    ///
    /// Connections to brokers whose address changed are dropped and reopened
    /// on next use.
    pub fn update_brokers(&self, brokers: Vec<BrokerInfo>) {
        for broker in brokers {
            let changed = self
                .brokers
                .get(&broker.node_id)
                .map_or(true, |known| *known.value() != broker);
            if changed {
                debug!(
                    broker_id = broker.node_id,
                    host = %broker.host,
                    port = broker.port,
                    "registered broker"
                );
                self.connections.remove(&broker.node_id);
                self.brokers.insert(broker.node_id, broker);
            }
        }
    }

    /// Get the number of known brokers.
    #[must_use]
    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    /// Check if the pool has any connections.
    pub async fn is_connected(&self) -> bool {
        if self.bootstrap.read().await.is_some() {
            return true;
        }
        !self.connections.is_empty()
    }

    /// Disconnect all brokers.
    pub async fn disconnect_all(&self) {
        if let Some(conn) = self.bootstrap.write().await.take() {
            conn.disconnect().await;
        }

        let connections: Vec<Arc<BrokerConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for conn in connections {
            conn.disconnect().await;
        }
    }
}

/// Information about a Kafka broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    /// The broker node ID.
    pub node_id: i32,
    /// The broker hostname.
    pub host: String,
    /// The broker port.
    pub port: u16,
}

impl BrokerInfo {
    /// Create a new broker info.
    #[must_use]
    pub fn new(node_id: i32, host: String, port: u16) -> Self {
        Self {
            node_id,
            host,
            port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::build_channel;

    const CLIENT_P12: &[u8] = include_bytes!("../../tests/fixtures/client.p12");
    const TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/truststore.p12");

    fn test_pool(brokers: Vec<String>) -> BrokerPool {
        let config = KafkaConfig {
            brokers,
            connection_timeout_ms: 100,
            request_timeout_ms: 1000,
            ..KafkaConfig::default()
        };
        let connector = build_channel(CLIENT_P12, "secret", TRUSTSTORE_P12, "secret")
            .unwrap()
            .connector();
        BrokerPool::new(config, connector)
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = test_pool(vec!["localhost:9094".to_string()]);
        assert_eq!(pool.broker_count(), 0);
        assert!(!pool.is_connected().await);
    }

    #[tokio::test]
    async fn test_get_broker_not_found() {
        let pool = test_pool(vec!["localhost:9094".to_string()]);
        let result = pool.get_broker(1).await;
        assert!(matches!(result, Err(ClientError::BrokerUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_connect_to_invalid_bootstrap() {
        let pool = test_pool(vec!["127.0.0.1:59999".to_string()]);
        let result = pool.connect().await;
        assert!(matches!(result, Err(ClientError::BrokerUnavailable { .. })));
        assert!(!pool.is_connected().await);
    }

    #[test]
    fn test_update_brokers() {
        let pool = test_pool(vec!["localhost:9094".to_string()]);
        pool.update_brokers(vec![
            BrokerInfo::new(1, "broker1.example.com".to_string(), 9094),
            BrokerInfo::new(2, "broker2.example.com".to_string(), 9094),
        ]);
        assert_eq!(pool.broker_count(), 2);

        pool.update_brokers(vec![BrokerInfo::new(
            1,
            "broker1.example.com".to_string(),
            9095,
        )]);
        assert_eq!(pool.broker_count(), 2);
        assert_eq!(pool.broker_info(1).unwrap().port, 9095);
    }
}
