//! TLS client connector for outbound broker connections.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::debug;

use crate::error::{TlsError, TlsResult};

/// TLS connector for outbound connections to Kafka brokers.
///
/// Obtained from [`ChannelConfig::connector`](crate::tls::ChannelConfig::connector);
/// cheap to clone.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl TlsConnector {
    pub(crate) fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: TokioTlsConnector::from(config),
        }
    }

    /// Connect to a broker over TLS.
    ///
    /// # Arguments
    ///
    /// * `server_name` - The hostname (or IP) for SNI and certificate verification
    /// * `stream` - The underlying TCP stream to wrap
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the handshake fails,
    /// including when the broker certificate does not chain to a trust anchor.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> TlsResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name: {e}")))?;

        debug!(server_name = ?server_name, "initiating TLS handshake");

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::tls::build_channel;

    const CLIENT_P12: &[u8] = include_bytes!("../../tests/fixtures/client.p12");
    const TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/truststore.p12");

    #[tokio::test]
    async fn test_invalid_server_name() {
        let channel = build_channel(CLIENT_P12, "secret", TRUSTSTORE_P12, "secret").unwrap();
        let connector = channel.connector();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();

        let result = connector.connect("not a valid host name!", stream).await;
        assert!(matches!(result, Err(crate::error::TlsError::Config(_))));
    }
}
