//! TLS server acceptor used by the mock broker.
//!
//! Mirrors a real broker listener configured with `ssl.client.auth=required`:
//! the server presents its own identity and rejects clients whose
//! certificate does not chain to the trust bundle.

use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;
use tracing::debug;

use crate::error::{TlsError, TlsResult};
use crate::tls::credentials::{decode_identity, decode_trust_anchors, IdentityBundle, TrustBundle};

/// TLS acceptor requiring client certificates.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TokioTlsAcceptor,
}

impl TlsServerAcceptor {
    /// Build an acceptor from a server identity archive and a trust archive
    /// used to verify clients.
    ///
    /// # Errors
    ///
    /// Returns an error if either archive cannot be decoded or the trust
    /// bundle is empty.
    pub fn from_pkcs12(
        identity_blob: &[u8],
        identity_password: &str,
        trust_blob: &[u8],
        trust_password: &str,
    ) -> TlsResult<Self> {
        let identity = decode_identity(identity_blob, identity_password)?;
        let trust = decode_trust_anchors(trust_blob, trust_password)?;
        Self::from_bundles(&identity, &trust)
    }

    /// Build an acceptor from decoded bundles.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity does not bind or no client verifier
    /// can be built from the trust bundle.
    pub fn from_bundles(identity: &IdentityBundle, trust: &TrustBundle) -> TlsResult<Self> {
        identity.verify_binding()?;

        let provider = Arc::new(default_provider());
        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(trust.iter().cloned());

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(format!("unsupported protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.chain().to_vec(), identity.private_key())
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))?;

        Ok(Self {
            inner: TokioTlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Accept a TLS connection from a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or the client presents no
    /// acceptable certificate.
    pub async fn accept(&self, stream: TcpStream) -> TlsResult<TlsStream<TcpStream>> {
        debug!("accepting TLS connection from client");

        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROKER_P12: &[u8] = include_bytes!("../../tests/fixtures/broker.p12");
    const TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/truststore.p12");

    #[test]
    fn test_acceptor_from_pkcs12() {
        let acceptor = TlsServerAcceptor::from_pkcs12(BROKER_P12, "secret", TRUSTSTORE_P12, "secret");
        assert!(acceptor.is_ok());
    }

    #[test]
    fn test_acceptor_requires_anchors() {
        let identity = decode_identity(BROKER_P12, "secret").unwrap();
        let result = TlsServerAcceptor::from_bundles(&identity, &TrustBundle::empty());
        assert!(matches!(result, Err(TlsError::Config(_))));
    }
}
