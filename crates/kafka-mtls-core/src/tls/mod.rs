//! Mutual TLS support for broker connections.
//!
//! The client identity and the trust anchors are read from two separate
//! PKCS#12 archives:
//!
//! - **Credentials** (`credentials` module): decode archives into an
//!   [`IdentityBundle`] and a [`TrustBundle`], and check key/certificate binding
//! - **Channel** (`channel` module): assemble the immutable rustls client
//!   configuration shared by every connection
//! - **Client** (`client` module): perform handshakes with brokers
//!
//! # Usage
//!
//! ```rust,ignore
//! use kafka_mtls_core::config::TlsConfig;
//! use kafka_mtls_core::tls::ChannelConfig;
//!
//! let channel = ChannelConfig::from_settings(&TlsConfig::default())?;
//! let tls_stream = channel.connector().connect("kafka.example.com", tcp_stream).await?;
//! ```

pub mod channel;
pub mod client;
pub mod credentials;
#[cfg(any(test, feature = "testing"))]
pub mod server;

pub use channel::{build_channel, ChannelConfig};
pub use client::TlsConnector;
pub use credentials::{
    decode_identity, decode_trust_anchors, read_identity_file, read_trust_file, IdentityBundle,
    TrustBundle,
};
#[cfg(any(test, feature = "testing"))]
pub use server::TlsServerAcceptor;
