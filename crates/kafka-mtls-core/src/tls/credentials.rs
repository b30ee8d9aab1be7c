//! PKCS#12 credential decoding.
//!
//! A client identity and its trust anchors arrive as two separate
//! password-protected PKCS#12 archives. This module turns them into the
//! DER material rustls consumes and checks that the identity's private key
//! actually belongs to its certificate.

use std::fmt;
use std::path::Path;

use p12_keystore::{KeyStore, KeyStoreEntry};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
    ECDSA_P384_SHA384_ASN1_SIGNING,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, warn};

use crate::error::{TlsError, TlsResult};

/// A client identity: one private key and the certificate chain it signs for.
///
/// The chain always starts with the leaf certificate. Any intermediates
/// carried in the same archive entry follow it.
pub struct IdentityBundle {
    key: PrivatePkcs8KeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
}

impl IdentityBundle {
    /// Assemble an identity from a PKCS#8 key and a leaf-first chain.
    ///
    /// No binding check is performed here; see [`IdentityBundle::verify_binding`].
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::MissingCertificate`] if `chain` is empty.
    pub fn from_parts(
        pkcs8_key: Vec<u8>,
        chain: Vec<CertificateDer<'static>>,
    ) -> TlsResult<Self> {
        if chain.is_empty() {
            return Err(TlsError::MissingCertificate);
        }
        Ok(Self {
            key: PrivatePkcs8KeyDer::from(pkcs8_key),
            chain,
        })
    }

    /// The leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Leaf followed by intermediates.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// A copy of the private key for handing to rustls.
    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    /// Public key derived from the private key, in the encoding X.509 uses
    /// inside `subjectPublicKey`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::UnsupportedKey`] if the key is not RSA, ECDSA
    /// P-256/P-384 or Ed25519.
    pub fn derived_public_key(&self) -> TlsResult<Vec<u8>> {
        derive_public_key(self.key.secret_pkcs8_der())
    }

    /// Public key bits of the leaf certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::CertificateParse`] if the leaf is not valid X.509.
    pub fn certificate_public_key(&self) -> TlsResult<Vec<u8>> {
        let (_, cert) = x509_parser::parse_x509_certificate(self.leaf().as_ref())
            .map_err(|e| TlsError::CertificateParse(e.to_string()))?;
        Ok(cert.public_key().subject_public_key.data.to_vec())
    }

    /// Check that the private key is the partner of the leaf certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::KeyMismatch`] when the keys differ, or the
    /// underlying parse error when either side cannot be read.
    pub fn verify_binding(&self) -> TlsResult<()> {
        let derived = self.derived_public_key()?;
        let certified = self.certificate_public_key()?;
        if derived != certified {
            return Err(TlsError::KeyMismatch);
        }
        Ok(())
    }
}

impl fmt::Debug for IdentityBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityBundle")
            .field("key", &"<redacted>")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Derive the public half of a PKCS#8 private key.
///
/// RSA keys yield a DER `RSAPublicKey`, ECDSA keys an uncompressed point and
/// Ed25519 keys the raw 32 bytes, which is what certificates carry.
fn derive_public_key(pkcs8: &[u8]) -> TlsResult<Vec<u8>> {
    if let Ok(pair) = RsaKeyPair::from_pkcs8(pkcs8) {
        return Ok(pair.public_key().as_ref().to_vec());
    }

    let rng = SystemRandom::new();
    for alg in [
        &ECDSA_P256_SHA256_ASN1_SIGNING,
        &ECDSA_P384_SHA384_ASN1_SIGNING,
    ] {
        if let Ok(pair) = EcdsaKeyPair::from_pkcs8(alg, pkcs8, &rng) {
            return Ok(pair.public_key().as_ref().to_vec());
        }
    }

    if let Ok(pair) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8) {
        return Ok(pair.public_key().as_ref().to_vec());
    }

    Err(TlsError::UnsupportedKey(
        "expected an RSA, ECDSA P-256/P-384 or Ed25519 PKCS#8 key".to_string(),
    ))
}

/// Trust anchors used to verify broker certificates.
///
/// Anchors are deduplicated by their DER encoding. An empty bundle is
/// allowed and rejects every peer.
#[derive(Debug, Clone, Default)]
pub struct TrustBundle {
    anchors: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an anchor. Returns `false` if an identical certificate is already present.
    pub fn insert(&mut self, cert: CertificateDer<'static>) -> bool {
        if self.anchors.iter().any(|a| a.as_ref() == cert.as_ref()) {
            return false;
        }
        self.anchors.push(cert);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateDer<'static>> {
        self.anchors.iter()
    }
}

fn open_keystore(blob: &[u8], password: &str) -> TlsResult<KeyStore> {
    KeyStore::from_pkcs12(blob, password).map_err(|e| TlsError::Decode {
        reason: e.to_string(),
    })
}

/// Decode a PKCS#12 archive holding exactly one private key and its chain.
///
/// # Errors
///
/// - [`TlsError::Decode`] for a wrong password, truncated data or an
///   unsupported encryption scheme
/// - [`TlsError::AmbiguousIdentity`] if the archive holds zero or several keys
/// - [`TlsError::MissingCertificate`] if the key entry carries no certificate
pub fn decode_identity(blob: &[u8], password: &str) -> TlsResult<IdentityBundle> {
    let store = open_keystore(blob, password)?;

    let mut key_chains = store.entries().filter_map(|(alias, entry)| match entry {
        KeyStoreEntry::PrivateKeyChain(chain) => Some((alias, chain)),
        KeyStoreEntry::Certificate(_) => None,
    });

    let (alias, chain) = match (key_chains.next(), key_chains.next()) {
        (Some(only), None) => only,
        (None, _) => return Err(TlsError::AmbiguousIdentity { count: 0 }),
        (Some(_), Some(_)) => {
            return Err(TlsError::AmbiguousIdentity {
                count: 2 + key_chains.count(),
            })
        }
    };

    let certs: Vec<CertificateDer<'static>> = chain
        .chain()
        .iter()
        .map(|c| CertificateDer::from(c.as_der().to_vec()))
        .collect();

    debug!(alias = %alias, chain_len = certs.len(), "decoded identity bundle");
    IdentityBundle::from_parts(chain.key().to_vec(), certs)
}

/// Decode a PKCS#12 archive of trust anchor certificates.
///
/// Private key entries are not anchors; they are skipped with a warning.
///
/// # Errors
///
/// Returns [`TlsError::Decode`] if the archive cannot be opened.
pub fn decode_trust_anchors(blob: &[u8], password: &str) -> TlsResult<TrustBundle> {
    let store = open_keystore(blob, password)?;

    let mut bundle = TrustBundle::empty();
    let mut duplicates = 0usize;
    for (alias, entry) in store.entries() {
        match entry {
            KeyStoreEntry::Certificate(cert) => {
                if !bundle.insert(CertificateDer::from(cert.as_der().to_vec())) {
                    duplicates += 1;
                }
            }
            KeyStoreEntry::PrivateKeyChain(_) => {
                warn!(alias = %alias, "ignoring private key entry in trust bundle");
            }
        }
    }

    debug!(anchors = bundle.len(), duplicates, "decoded trust bundle");
    Ok(bundle)
}

fn read_file(path: &Path) -> TlsResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| TlsError::Read {
        path: path.display().to_string(),
        source: e,
    })
}

/// Read and decode an identity bundle from disk.
///
/// # Errors
///
/// Returns [`TlsError::Read`] if the file cannot be read, otherwise the
/// errors of [`decode_identity`].
pub fn read_identity_file(path: &Path, password: &str) -> TlsResult<IdentityBundle> {
    let blob = read_file(path)?;
    decode_identity(&blob, password)
}

/// Read and decode a trust bundle from disk.
///
/// # Errors
///
/// Returns [`TlsError::Read`] if the file cannot be read, otherwise the
/// errors of [`decode_trust_anchors`].
pub fn read_trust_file(path: &Path, password: &str) -> TlsResult<TrustBundle> {
    let blob = read_file(path)?;
    decode_trust_anchors(&blob, password)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_P12: &[u8] = include_bytes!("../../tests/fixtures/client.p12");
    const CLIENT_EC_P12: &[u8] = include_bytes!("../../tests/fixtures/client-ec.p12");
    const CLIENT_TWO_KEYS_P12: &[u8] = include_bytes!("../../tests/fixtures/client-two-keys.p12");
    const TRUSTSTORE_P12: &[u8] = include_bytes!("../../tests/fixtures/truststore.p12");
    const TRUSTSTORE_DUPLICATES_P12: &[u8] =
        include_bytes!("../../tests/fixtures/truststore-duplicates.p12");
    const CLIENT_KEY_DER: &[u8] = include_bytes!("../../tests/fixtures/client-key.pk8.der");
    const BROKER_CERT_DER: &[u8] = include_bytes!("../../tests/fixtures/broker-cert.der");
    const CLIENT_CERT_DER: &[u8] = include_bytes!("../../tests/fixtures/client-cert.der");

    #[test]
    fn test_decode_rsa_identity() {
        let identity = decode_identity(CLIENT_P12, "secret").unwrap();
        assert!(!identity.chain().is_empty());
        assert!(identity.verify_binding().is_ok());
        assert_eq!(
            identity.derived_public_key().unwrap(),
            identity.certificate_public_key().unwrap()
        );
    }

    #[test]
    fn test_decode_ec_identity() {
        let identity = decode_identity(CLIENT_EC_P12, "secret").unwrap();
        let derived = identity.derived_public_key().unwrap();
        // uncompressed P-256 point
        assert_eq!(derived.len(), 65);
        assert_eq!(derived[0], 0x04);
        assert!(identity.verify_binding().is_ok());
    }

    #[test]
    fn test_wrong_password() {
        let result = decode_identity(CLIENT_P12, "not-the-password");
        assert!(matches!(result, Err(TlsError::Decode { .. })));
    }

    #[test]
    fn test_truncated_archive() {
        let truncated = &CLIENT_P12[..CLIENT_P12.len() / 2];
        assert!(matches!(
            decode_identity(truncated, "secret"),
            Err(TlsError::Decode { .. })
        ));
        assert!(matches!(
            decode_trust_anchors(truncated, "secret"),
            Err(TlsError::Decode { .. })
        ));
    }

    #[test]
    fn test_identity_from_trust_only_archive() {
        let result = decode_identity(TRUSTSTORE_P12, "secret");
        assert!(matches!(
            result,
            Err(TlsError::AmbiguousIdentity { count: 0 })
        ));
    }

    #[test]
    fn test_identity_with_two_keys() {
        let result = decode_identity(CLIENT_TWO_KEYS_P12, "secret");
        assert!(matches!(
            result,
            Err(TlsError::AmbiguousIdentity { count: 2 })
        ));
    }

    #[test]
    fn test_decode_trust_anchors() {
        let bundle = decode_trust_anchors(TRUSTSTORE_P12, "secret").unwrap();
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_duplicate_anchors_are_collapsed() {
        let bundle = decode_trust_anchors(TRUSTSTORE_DUPLICATES_P12, "secret").unwrap();
        assert_eq!(bundle.len(), 2);
    }

    #[test]
    fn test_key_entries_are_not_anchors() {
        let bundle = decode_trust_anchors(CLIENT_P12, "secret").unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_trust_bundle_insert_dedupes() {
        let mut bundle = TrustBundle::empty();
        assert!(bundle.insert(CertificateDer::from(BROKER_CERT_DER.to_vec())));
        assert!(!bundle.insert(CertificateDer::from(BROKER_CERT_DER.to_vec())));
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_key_mismatch_detected() {
        let identity = IdentityBundle::from_parts(
            CLIENT_KEY_DER.to_vec(),
            vec![CertificateDer::from(BROKER_CERT_DER.to_vec())],
        )
        .unwrap();
        assert!(matches!(
            identity.verify_binding(),
            Err(TlsError::KeyMismatch)
        ));
    }

    #[test]
    fn test_matching_parts_bind() {
        let identity = IdentityBundle::from_parts(
            CLIENT_KEY_DER.to_vec(),
            vec![CertificateDer::from(CLIENT_CERT_DER.to_vec())],
        )
        .unwrap();
        assert!(identity.verify_binding().is_ok());
    }

    #[test]
    fn test_empty_chain_rejected() {
        let result = IdentityBundle::from_parts(CLIENT_KEY_DER.to_vec(), Vec::new());
        assert!(matches!(result, Err(TlsError::MissingCertificate)));
    }

    #[test]
    fn test_unsupported_key() {
        let identity = IdentityBundle::from_parts(
            b"not a pkcs8 key".to_vec(),
            vec![CertificateDer::from(CLIENT_CERT_DER.to_vec())],
        )
        .unwrap();
        assert!(matches!(
            identity.verify_binding(),
            Err(TlsError::UnsupportedKey(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let identity = decode_identity(CLIENT_P12, "secret").unwrap();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_read_missing_file() {
        let result = read_identity_file(Path::new("/nonexistent/client.p12"), "secret");
        assert!(matches!(result, Err(TlsError::Read { .. })));
    }

    #[test]
    fn test_read_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let identity_path = dir.path().join("client.p12");
        let trust_path = dir.path().join("truststore.p12");
        std::fs::write(&identity_path, CLIENT_P12).unwrap();
        std::fs::write(&trust_path, TRUSTSTORE_P12).unwrap();

        assert!(read_identity_file(&identity_path, "secret").is_ok());
        assert_eq!(read_trust_file(&trust_path, "secret").unwrap().len(), 1);
    }
}
