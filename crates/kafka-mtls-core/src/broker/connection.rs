//! Single Kafka broker connection.
//!
//! Manages one mutually authenticated TLS connection to a broker with
//! correlation ID tracking for request/response matching.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, instrument, warn};

use crate::error::{ClientError, Result};
use crate::tls::TlsConnector;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest response frame accepted from a broker.
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// A connection to a single Kafka broker.
pub struct BrokerConnection {
    broker_id: i32,
    host: String,
    port: u16,
    client_id: String,
    connector: TlsConnector,
    stream: Mutex<Option<TlsStream<TcpStream>>>,
    correlation_id: AtomicI32,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl BrokerConnection {
    /// Create a new broker connection (not yet connected).
    #[must_use]
    pub fn new(broker_id: i32, host: String, port: u16, connector: TlsConnector) -> Self {
        Self {
            broker_id,
            host,
            port,
            client_id: "kafka-mtls".to_string(),
            connector,
            stream: Mutex::new(None),
            correlation_id: AtomicI32::new(0),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Get the broker ID.
    #[must_use]
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// Get the broker address as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the connection is established.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Connect to the broker and complete the TLS handshake.
    ///
    /// The broker's certificate is verified against the channel's trust
    /// anchors using the broker host as the expected name.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection fails or times out, or if the
    /// handshake is rejected by either side.
    #[instrument(skip(self), fields(broker_id = self.broker_id, host = %self.host, port = self.port))]
    pub async fn connect(&self) -> Result<()> {
        let address = (self.host.as_str(), self.port);
        let tcp_stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to broker");
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!("connection timeout");
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "connection timeout".to_string(),
                });
            }
        };
        tcp_stream.set_nodelay(true)?;

        debug!("TCP connection established");

        let tls_stream = match timeout(
            self.connect_timeout,
            self.connector.connect(&self.host, tcp_stream),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "TLS handshake failed");
                return Err(e.into());
            }
            Err(_) => {
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "TLS handshake timeout".to_string(),
                });
            }
        };

        debug!("TLS handshake completed");
        *self.stream.lock().await = Some(tls_stream);
        Ok(())
    }

    /// Disconnect from the broker, sending a TLS close notify if possible.
    pub async fn disconnect(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(broker_id = self.broker_id, error = %e, "error during TLS shutdown");
            }
        }
    }

    /// Encode `request`, send it and decode the typed response.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not established, the exchange
    /// fails or times out, or either side cannot be encoded/decoded.
    pub async fn call<Req, Resp>(
        &self,
        api_key: ApiKey,
        api_version: i16,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Encodable + HeaderVersion,
        Resp: Decodable + HeaderVersion,
    {
        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = api_version;
        header.correlation_id = self.next_correlation_id();
        header.client_id = Some(StrBytes::from_string(self.client_id.clone()));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, Req::header_version(api_version))
            .map_err(|e| ClientError::ProtocolEncode {
                message: format!("failed to encode {api_key:?} header: {e}"),
            })?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| ClientError::ProtocolEncode {
                message: format!("failed to encode {api_key:?} request: {e}"),
            })?;

        let mut response = self.send_request(&buf).await?;

        ResponseHeader::decode(&mut response, Resp::header_version(api_version)).map_err(|e| {
            ClientError::ProtocolDecode {
                message: format!("failed to decode {api_key:?} response header: {e}"),
            }
        })?;
        Resp::decode(&mut response, api_version).map_err(|e| ClientError::ProtocolDecode {
            message: format!("failed to decode {api_key:?} response: {e}"),
        })
    }

    /// Send a raw request (header and body, without length prefix) and
    /// return the raw response starting with its correlation ID.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, timeout or correlation ID mismatch.
    #[instrument(skip(self, request_bytes), fields(broker_id = self.broker_id))]
    pub async fn send_request(&self, request_bytes: &[u8]) -> Result<Bytes> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(ClientError::BrokerUnavailable {
            broker_id: self.broker_id,
            message: "not connected".to_string(),
        })?;

        // api_key (2) + api_version (2) + correlation_id (4)
        if request_bytes.len() < 8 {
            return Err(ClientError::ProtocolEncode {
                message: "request too short".to_string(),
            });
        }
        let correlation_id = i32::from_be_bytes([
            request_bytes[4],
            request_bytes[5],
            request_bytes[6],
            request_bytes[7],
        ]);

        debug!(
            correlation_id,
            request_len = request_bytes.len(),
            "sending request"
        );

        let mut write_buf = BytesMut::with_capacity(4 + request_bytes.len());
        write_buf.put_u32(request_bytes.len() as u32);
        write_buf.extend_from_slice(request_bytes);

        let write_result = timeout(self.request_timeout, async {
            stream.write_all(&write_buf).await?;
            stream.flush().await
        })
        .await;

        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                *guard = None;
                return Err(ClientError::Connection(e));
            }
            Err(_) => {
                *guard = None;
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "write timeout".to_string(),
                });
            }
        }

        let read_result = timeout(self.request_timeout, async {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u32::from_be_bytes(len_buf) as usize;
            if response_len > MAX_RESPONSE_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("response of {response_len} bytes exceeds limit"),
                ));
            }

            let mut response_buf = vec![0u8; response_len];
            stream.read_exact(&mut response_buf).await?;

            Ok::<_, std::io::Error>(response_buf)
        })
        .await;

        let response_buf = match read_result {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                *guard = None;
                return Err(ClientError::Connection(e));
            }
            Err(_) => {
                // a late response would desynchronize the stream
                *guard = None;
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "read timeout".to_string(),
                });
            }
        };

        if response_buf.len() < 4 {
            return Err(ClientError::ProtocolDecode {
                message: "response too short".to_string(),
            });
        }

        let response_correlation_id = i32::from_be_bytes([
            response_buf[0],
            response_buf[1],
            response_buf[2],
            response_buf[3],
        ]);

        if response_correlation_id != correlation_id {
            return Err(ClientError::CorrelationIdMismatch {
                expected: correlation_id,
                actual: response_correlation_id,
            });
        }

        debug!(
            correlation_id,
            response_len = response_buf.len(),
            "received response"
        );

        Ok(Bytes::from(response_buf))
    }

    /// Get the next correlation ID.
    #[must_use]
    pub fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::build_channel;

    const CLIENT_P12: &[u8] = include_bytes!("../../tests/fixtures/client.p12");
    const TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/truststore.p12");

    fn connector() -> TlsConnector {
        build_channel(CLIENT_P12, "secret", TRUSTSTORE_P12, "secret")
            .unwrap()
            .connector()
    }

    #[test]
    fn test_broker_connection_new() {
        let conn = BrokerConnection::new(1, "localhost".to_string(), 9094, connector());
        assert_eq!(conn.broker_id(), 1);
        assert_eq!(conn.address(), "localhost:9094");
    }

    #[test]
    fn test_correlation_id_generation() {
        let conn = BrokerConnection::new(1, "localhost".to_string(), 9094, connector());
        let id1 = conn.next_correlation_id();
        let id2 = conn.next_correlation_id();
        let id3 = conn.next_correlation_id();

        assert_eq!(id1, 0);
        assert_eq!(id2, 1);
        assert_eq!(id3, 2);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let conn = BrokerConnection::new(1, "localhost".to_string(), 9094, connector());
        assert!(!conn.is_connected().await);

        let result = conn.send_request(&[0u8; 16]).await;
        assert!(matches!(result, Err(ClientError::BrokerUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_connect_to_invalid_address() {
        let conn = BrokerConnection::new(1, "127.0.0.1".to_string(), 59999, connector())
            .with_timeouts(Duration::from_millis(100), Duration::from_secs(1));

        let result = conn.connect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let conn = BrokerConnection::new(1, "localhost".to_string(), 9094, connector());
        conn.disconnect().await;
        conn.disconnect().await;
        assert!(!conn.is_connected().await);
    }
}
