//! Secure transport capability and the BoringSSL implementation.

use std::fmt;

use async_trait::async_trait;
use boring::ssl::{SslConnector, SslMethod, SslRef, SslSessionCacheMode, SslVersion};
use boring::x509::X509;
use bytes::Bytes;

use crate::endpoint::CapabilityEq;
use crate::error::{Error, Result};
use crate::protocol::{alpn_wire_format, Protocol};
use crate::transport::profile::{TlsProfile, TlsVersion};
use crate::transport::BoxedIo;

/// DER-encoded X.509 certificate.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate(Bytes);

impl Certificate {
    pub fn from_der(der: impl Into<Bytes>) -> Self {
        Self(der.into())
    }

    pub fn der(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({} bytes)", self.0.len())
    }
}

/// Result of a completed TLS handshake.
pub struct SecureStream {
    /// Encrypted stream.
    pub io: BoxedIo,
    /// Protocol selected by the peer via ALPN, if any.
    pub alpn: Option<Vec<u8>>,
    /// Peer certificates, leaf first.
    pub peer_chain: Vec<Certificate>,
}

impl fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("peer_chain", &self.peer_chain)
            .finish_non_exhaustive()
    }
}

/// Wraps a raw stream in TLS.
///
/// Implementations perform the handshake and chain validation only; hostname
/// verification and pinning run afterwards against `peer_chain`.
#[async_trait]
pub trait SecureTransportFactory: CapabilityEq {
    async fn wrap(
        &self,
        io: BoxedIo,
        server_name: &str,
        profile: &TlsProfile,
        alpn: &[Protocol],
    ) -> Result<SecureStream>;
}

/// BoringSSL-based secure transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BoringTlsFactory {
    root_certs: Vec<Vec<u8>>,
}

impl BoringTlsFactory {
    /// Create a factory trusting the system roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add custom root certificates (DER or PEM).
    pub fn with_root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    fn configure_ssl(&self, profile: &TlsProfile, alpn: &[Protocol]) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::config(format!("Failed to create SSL connector: {}", e)))?;

        for cert_bytes in &self.root_certs {
            let cert = X509::from_der(cert_bytes)
                .or_else(|_| X509::from_pem(cert_bytes))
                .map_err(|e| Error::config(format!("Invalid root certificate: {}", e)))?;
            builder
                .cert_store_mut()
                .add_cert(cert)
                .map_err(|e| Error::config(format!("Failed to add root certificate: {}", e)))?;
        }

        if !profile.cipher_list.is_empty() {
            builder
                .set_cipher_list(&profile.cipher_list.join(":"))
                .map_err(|e| Error::config(format!("Failed to set cipher list: {}", e)))?;
        }

        if !profile.curves.is_empty() {
            builder
                .set_curves_list(&profile.curves.join(":"))
                .map_err(|e| Error::config(format!("Failed to set curves: {}", e)))?;
        }

        builder
            .set_min_proto_version(Some(ssl_version(profile.min_version)))
            .map_err(|e| Error::config(format!("Failed to set min TLS version: {}", e)))?;
        builder
            .set_max_proto_version(Some(ssl_version(profile.max_version)))
            .map_err(|e| Error::config(format!("Failed to set max TLS version: {}", e)))?;

        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

        let wire = alpn_wire_format(alpn);
        if !wire.is_empty() {
            builder
                .set_alpn_protos(&wire)
                .map_err(|e| Error::config(format!("Failed to set ALPN: {}", e)))?;
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl SecureTransportFactory for BoringTlsFactory {
    async fn wrap(
        &self,
        io: BoxedIo,
        server_name: &str,
        profile: &TlsProfile,
        alpn: &[Protocol],
    ) -> Result<SecureStream> {
        let connector = self.configure_ssl(profile, alpn)?;
        let mut config = connector
            .configure()
            .map_err(|e| Error::config(format!("Failed to configure SSL: {}", e)))?;
        // Hostname checks belong to the endpoint's HostnameVerifier.
        config.set_verify_hostname(false);

        let stream = tokio_boring::connect(config, server_name, io)
            .await
            .map_err(|e| Error::handshake(e.to_string()))?;

        let alpn = stream.ssl().selected_alpn_protocol().map(<[u8]>::to_vec);
        let peer_chain = peer_chain(stream.ssl());
        tracing::trace!(
            "TLS: handshake with {} complete ({}, {} peer certs)",
            server_name,
            profile.name,
            peer_chain.len()
        );

        Ok(SecureStream {
            io: Box::new(stream),
            alpn,
            peer_chain,
        })
    }
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Tls10 => SslVersion::TLS1,
        TlsVersion::Tls11 => SslVersion::TLS1_1,
        TlsVersion::Tls12 => SslVersion::TLS1_2,
        TlsVersion::Tls13 => SslVersion::TLS1_3,
    }
}

fn peer_chain(ssl: &SslRef) -> Vec<Certificate> {
    let mut chain = Vec::new();
    if let Some(der) = ssl.peer_certificate().and_then(|leaf| leaf.to_der().ok()) {
        chain.push(Certificate::from_der(der));
    }
    if let Some(stack) = ssl.peer_cert_chain() {
        for cert in stack.iter() {
            if let Ok(der) = cert.to_der() {
                let cert = Certificate::from_der(der);
                if !chain.contains(&cert) {
                    chain.push(cert);
                }
            }
        }
    }
    chain
}
