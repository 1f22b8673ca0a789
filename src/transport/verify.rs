//! Peer verification: hostname matching and certificate pinning.
//!
//! Both run after the TLS handshake against the peer chain it produced.
//! Pinning runs after hostname verification and fails with its own error.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use boring::hash::{hash, MessageDigest};
use boring::x509::X509;

use crate::endpoint::CapabilityEq;
use crate::error::{Error, Result};
use crate::transport::tls::Certificate;

/// Checks that a peer certificate chain belongs to the expected host.
pub trait HostnameVerifier: CapabilityEq {
    fn verify(&self, host: &str, chain: &[Certificate]) -> bool;
}

/// Matches the leaf certificate's subject alternative names (RFC 6125).
///
/// DNS names match case-insensitively; a wildcard may only stand for the
/// whole left-most label. IP literals match IP SANs only. The subject common
/// name is never consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DefaultHostnameVerifier;

impl HostnameVerifier for DefaultHostnameVerifier {
    fn verify(&self, host: &str, chain: &[Certificate]) -> bool {
        let Some(leaf) = chain.first() else {
            return false;
        };
        let Ok(cert) = X509::from_der(leaf.der()) else {
            return false;
        };
        let Some(names) = cert.subject_alt_names() else {
            return false;
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            names
                .iter()
                .filter_map(|name| name.ipaddress())
                .any(|raw| ip_matches(ip, raw))
        } else {
            names
                .iter()
                .filter_map(|name| name.dnsname())
                .any(|pattern| dns_name_matches(host, pattern))
        }
    }
}

fn ip_matches(ip: IpAddr, raw: &[u8]) -> bool {
    match (ip, raw.len()) {
        (IpAddr::V4(v4), 4) => v4.octets() == raw,
        (IpAddr::V6(v6), 16) => v6.octets() == raw,
        _ => false,
    }
}

/// Match `host` against a certificate DNS name, which may start with `*.`.
pub fn dns_name_matches(host: &str, pattern: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || pattern.is_empty() {
        return false;
    }

    if !pattern.contains('*') {
        return host == pattern;
    }

    // Only "*.rest", with no other wildcard anywhere.
    let Some(suffix) = pattern.strip_prefix('*') else {
        return false;
    };
    if !suffix.starts_with('.') || suffix.contains('*') || suffix.len() < 2 {
        return false;
    }
    // "*.com" style patterns cover a whole public suffix.
    if !suffix[1..].contains('.') {
        return false;
    }
    match host.strip_suffix(suffix) {
        Some(label) => !label.is_empty() && !label.contains('.'),
        None => false,
    }
}

/// Restricts which certificates a host may present.
pub trait CertificatePinner: CapabilityEq {
    /// Accept or reject `chain` for `host`. Hosts without pins always pass.
    fn check(&self, host: &str, chain: &[Certificate]) -> Result<()>;
}

/// One pin: a host pattern and the SHA-256 of an accepted public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pin {
    pattern: String,
    sha256: Vec<u8>,
}

impl Pin {
    /// Parse a `sha256/<base64>` pin for `pattern`.
    ///
    /// Patterns are exact hosts, `*.example.com` (exactly one extra label) or
    /// `**.example.com` (any number of extra labels, including none).
    pub fn new(pattern: &str, pin: &str) -> Result<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return Err(Error::config("pin pattern must not be empty"));
        }
        let encoded = pin.strip_prefix("sha256/").ok_or_else(|| {
            Error::config(format!("pins must start with 'sha256/': {}", pin))
        })?;
        let sha256 = STANDARD
            .decode(encoded)
            .map_err(|e| Error::config(format!("invalid pin {}: {}", pin, e)))?;
        if sha256.len() != 32 {
            return Err(Error::config(format!("invalid pin length: {}", pin)));
        }
        Ok(Self { pattern, sha256 })
    }

    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(suffix) = self.pattern.strip_prefix("**.") {
            host == suffix
                || host
                    .strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        } else if let Some(suffix) = self.pattern.strip_prefix("*.") {
            host.strip_suffix(suffix)
                .and_then(|prefix| prefix.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.'))
        } else {
            host == self.pattern
        }
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256/{}", STANDARD.encode(&self.sha256))
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin({} => {})", self.pattern, self)
    }
}

/// Set of public-key pins. The empty set accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PinSet {
    pins: BTreeSet<Pin>,
}

impl PinSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a `sha256/<base64>` pin for a host pattern.
    pub fn with_pin(mut self, pattern: &str, pin: &str) -> Result<Self> {
        self.pins.insert(Pin::new(pattern, pin)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Pin string for a certificate's public key.
    pub fn pin_for(cert: &Certificate) -> Result<String> {
        Ok(format!("sha256/{}", STANDARD.encode(spki_sha256(cert)?)))
    }
}

impl CertificatePinner for PinSet {
    fn check(&self, host: &str, chain: &[Certificate]) -> Result<()> {
        let matching: Vec<&Pin> = self.pins.iter().filter(|p| p.matches_host(host)).collect();
        if matching.is_empty() {
            return Ok(());
        }

        let mut seen = Vec::with_capacity(chain.len());
        for cert in chain {
            // an unreadable certificate cannot satisfy a pin
            let Ok(digest) = spki_sha256(cert) else {
                seen.push("<unparseable certificate>".to_string());
                continue;
            };
            if matching.iter().any(|pin| pin.sha256 == digest) {
                return Ok(());
            }
            seen.push(format!("sha256/{}", STANDARD.encode(&digest)));
        }

        Err(Error::PinMismatch {
            host: host.to_string(),
            pins: matching
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            chain: seen.join(", "),
        })
    }
}

fn spki_sha256(cert: &Certificate) -> Result<Vec<u8>> {
    let x509 = X509::from_der(cert.der())
        .map_err(|e| Error::handshake(format!("unparseable peer certificate: {}", e)))?;
    let key = x509
        .public_key()
        .map_err(|e| Error::handshake(format!("peer certificate has no public key: {}", e)))?;
    let spki = key
        .public_key_to_der()
        .map_err(|e| Error::handshake(format!("failed to encode public key: {}", e)))?;
    let digest = hash(MessageDigest::sha256(), &spki)
        .map_err(|e| Error::handshake(format!("failed to hash public key: {}", e)))?;
    Ok(digest.to_vec())
}
