//! mTLS handshake tests for the channel builder.
//!
//! A local TLS listener built from the broker fixtures plays the broker.

use std::time::Duration;

use kafka_mtls_core::error::TlsError;
use kafka_mtls_core::testing::fixtures::{self, PASSWORD};
use kafka_mtls_core::tls::{
    build_channel, decode_identity, read_identity_file, ChannelConfig, TlsServerAcceptor,
    TrustBundle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Accept one connection, echo one byte, and report the handshake outcome.
async fn serve_once(acceptor: TlsServerAcceptor) -> (String, JoinHandle<Result<(), TlsError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await?;
        let mut byte = [0u8; 1];
        if tls.read_exact(&mut byte).await.is_ok() {
            let _ = tls.write_all(&byte).await;
            let _ = tls.flush().await;
        }
        Ok(())
    });
    (addr, handle)
}

async fn exchange(channel: &ChannelConfig, addr: &str, server_name: &str) -> Result<u8, TlsError> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = channel.connector().connect(server_name, tcp).await?;
    tls.write_all(&[42]).await.map_err(|e| TlsError::Handshake(e.to_string()))?;
    tls.flush().await.map_err(|e| TlsError::Handshake(e.to_string()))?;
    let mut byte = [0u8; 1];
    tls.read_exact(&mut byte)
        .await
        .map_err(|e| TlsError::Handshake(e.to_string()))?;
    Ok(byte[0])
}

#[tokio::test]
async fn test_mutual_handshake_succeeds() {
    let (addr, server) = serve_once(fixtures::broker_acceptor()).await;
    let channel = fixtures::client_channel();

    let echoed = tokio::time::timeout(Duration::from_secs(5), exchange(&channel, &addr, "localhost"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, 42);
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_ec_identity_handshake_succeeds() {
    let (addr, server) = serve_once(fixtures::broker_acceptor()).await;
    let channel = ChannelConfig::build(
        fixtures::CLIENT_EC_P12,
        PASSWORD,
        fixtures::TRUSTSTORE_P12,
        PASSWORD,
    )
    .unwrap();

    let echoed = exchange(&channel, &addr, "127.0.0.1").await.unwrap();
    assert_eq!(echoed, 42);
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_untrusted_broker_rejected() {
    let (addr, _server) = serve_once(fixtures::rogue_broker_acceptor()).await;
    let channel = fixtures::client_channel();

    let result = exchange(&channel, &addr, "localhost").await;
    assert!(matches!(result, Err(TlsError::Handshake(_))));
}

#[tokio::test]
async fn test_server_name_must_match_certificate() {
    let (addr, _server) = serve_once(fixtures::broker_acceptor()).await;
    let channel = fixtures::client_channel();

    let result = exchange(&channel, &addr, "kafka.example.com").await;
    assert!(matches!(result, Err(TlsError::Handshake(_))));
}

#[tokio::test]
async fn test_empty_trust_fails_closed() {
    let (addr, _server) = serve_once(fixtures::broker_acceptor()).await;
    let identity = decode_identity(fixtures::CLIENT_P12, PASSWORD).unwrap();
    let channel = ChannelConfig::from_bundles(&identity, &TrustBundle::empty()).unwrap();
    assert_eq!(channel.trust_anchor_count(), 0);

    let result = exchange(&channel, &addr, "localhost").await;
    assert!(matches!(result, Err(TlsError::Handshake(_))));
}

#[tokio::test]
async fn test_broker_rejects_untrusted_client() {
    // broker only trusts the rogue CA, so our client certificate is refused
    let acceptor = TlsServerAcceptor::from_pkcs12(
        fixtures::BROKER_P12,
        PASSWORD,
        fixtures::ROGUE_TRUSTSTORE_P12,
        PASSWORD,
    )
    .unwrap();
    let (addr, server) = serve_once(acceptor).await;
    let channel = fixtures::client_channel();

    let result = exchange(&channel, &addr, "localhost").await;
    assert!(result.is_err());
    assert!(matches!(server.await.unwrap(), Err(TlsError::Handshake(_))));
}

#[test]
fn test_duplicate_anchors_are_deduplicated() {
    let channel = ChannelConfig::build(
        fixtures::CLIENT_P12,
        PASSWORD,
        fixtures::TRUSTSTORE_DUPLICATES_P12,
        PASSWORD,
    )
    .unwrap();
    assert_eq!(channel.trust_anchor_count(), 2);
}

#[test]
fn test_trust_archive_is_not_an_identity() {
    let result = decode_identity(fixtures::TRUSTSTORE_P12, PASSWORD);
    assert!(matches!(result, Err(TlsError::AmbiguousIdentity { count: 0 })));
}

#[test]
fn test_two_key_archive_is_rejected() {
    let result = decode_identity(fixtures::CLIENT_TWO_KEYS_P12, PASSWORD);
    assert!(matches!(result, Err(TlsError::AmbiguousIdentity { count: 2 })));

    let result = build_channel(
        fixtures::CLIENT_TWO_KEYS_P12,
        PASSWORD,
        fixtures::TRUSTSTORE_P12,
        PASSWORD,
    );
    assert!(matches!(result, Err(TlsError::AmbiguousIdentity { count: 2 })));
}

#[test]
fn test_settings_resolve_fixture_files() {
    let mut config = kafka_mtls_core::AppConfig::default();
    config.tls.directory = fixtures::fixture_dir();
    let channel = ChannelConfig::from_settings(&config.tls).unwrap();
    assert_eq!(channel.trust_anchor_count(), 1);

    config.tls.keystore_filename = "missing.p12".to_string();
    let result = ChannelConfig::from_settings(&config.tls);
    assert!(matches!(result, Err(TlsError::Read { .. })));
}

#[test]
fn test_read_identity_file_reports_path() {
    let path = fixtures::fixture_dir().join("nope.p12");
    match read_identity_file(&path, PASSWORD) {
        Err(TlsError::Read { path: reported, .. }) => {
            assert_eq!(reported, path.display().to_string());
        }
        other => panic!("expected read error, got {other:?}"),
    }
}
