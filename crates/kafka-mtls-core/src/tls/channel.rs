//! Secure channel configuration built from two PKCS#12 bundles.
//!
//! The resulting configuration always presents the client identity and
//! always verifies the broker against the trust bundle. There is no switch
//! to turn verification off.

use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, info, warn};

use crate::config::TlsConfig;
use crate::error::{TlsError, TlsResult};
use crate::tls::client::TlsConnector;
use crate::tls::credentials::{
    decode_identity, decode_trust_anchors, read_identity_file, read_trust_file, IdentityBundle,
    TrustBundle,
};

/// Protocol versions offered to brokers. TLS 1.2 is the floor.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Immutable client-side TLS configuration shared by every broker connection.
#[derive(Clone)]
pub struct ChannelConfig {
    client_config: Arc<ClientConfig>,
    trust_anchors: usize,
}

impl ChannelConfig {
    /// Build a channel from raw identity and trust archives.
    ///
    /// # Errors
    ///
    /// Any decode failure, an ambiguous identity or a key that does not
    /// match its certificate.
    pub fn build(
        identity_blob: &[u8],
        identity_password: &str,
        trust_blob: &[u8],
        trust_password: &str,
    ) -> TlsResult<Self> {
        let identity = decode_identity(identity_blob, identity_password)?;
        let trust = decode_trust_anchors(trust_blob, trust_password)?;
        Self::from_bundles(&identity, &trust)
    }

    /// Build a channel from the files named in the TLS settings.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Read`] if either file is missing, otherwise the
    /// errors of [`ChannelConfig::build`].
    pub fn from_settings(settings: &TlsConfig) -> TlsResult<Self> {
        let keystore = settings.keystore_path();
        let truststore = settings.truststore_path();
        debug!(
            keystore = %keystore.display(),
            truststore = %truststore.display(),
            "loading TLS bundles"
        );

        let identity = read_identity_file(&keystore, &settings.keystore_password())?;
        let trust = read_trust_file(&truststore, &settings.truststore_password())?;
        Self::from_bundles(&identity, &trust)
    }

    /// Build a channel from already decoded bundles.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::KeyMismatch`] if the identity's key does not
    /// belong to its leaf certificate, or [`TlsError::Config`] if rustls
    /// rejects the material.
    pub fn from_bundles(identity: &IdentityBundle, trust: &TrustBundle) -> TlsResult<Self> {
        identity.verify_binding()?;

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(trust.iter().cloned());
        if ignored > 0 {
            warn!(ignored, "skipped unparsable trust anchors");
        }
        if roots.is_empty() {
            warn!("trust bundle is empty, every broker certificate will be rejected");
        }

        let client_config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| TlsError::Config(format!("unsupported protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_client_auth_cert(identity.chain().to_vec(), identity.private_key())
            .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))?;

        info!(trust_anchors = added, "built mTLS channel configuration");

        Ok(Self {
            client_config: Arc::new(client_config),
            trust_anchors: added,
        })
    }

    /// Number of anchors in the verification pool.
    #[must_use]
    pub fn trust_anchor_count(&self) -> usize {
        self.trust_anchors
    }

    #[must_use]
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client_config)
    }

    /// A connector performing handshakes with this configuration.
    #[must_use]
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::new(self.client_config())
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("trust_anchors", &self.trust_anchors)
            .finish_non_exhaustive()
    }
}

/// Build a channel configuration from an identity archive and a trust archive.
///
/// Shorthand for [`ChannelConfig::build`].
///
/// # Errors
///
/// See [`ChannelConfig::build`].
pub fn build_channel(
    identity_blob: &[u8],
    identity_password: &str,
    trust_blob: &[u8],
    trust_password: &str,
) -> TlsResult<ChannelConfig> {
    ChannelConfig::build(identity_blob, identity_password, trust_blob, trust_password)
}
