//! TLS configuration profiles.
//!
//! An endpoint lists acceptable profiles in preference order. A secure
//! connection tries them in turn when a handshake fails; plain endpoints must
//! list [`TlsProfile::cleartext`].

/// Modern AEAD suites (OpenSSL names). TLS 1.3 suites are always enabled.
pub const MODERN_CIPHER_SUITES: &[&str] = &[
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-CHACHA20-POLY1305",
    "ECDHE-RSA-CHACHA20-POLY1305",
];

/// Modern suites plus CBC and static-RSA suites for older servers.
pub const COMPATIBLE_CIPHER_SUITES: &[&str] = &[
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-CHACHA20-POLY1305",
    "ECDHE-RSA-CHACHA20-POLY1305",
    "ECDHE-RSA-AES128-SHA",
    "ECDHE-RSA-AES256-SHA",
    "AES128-GCM-SHA256",
    "AES256-GCM-SHA384",
    "AES128-SHA",
    "AES256-SHA",
];

/// Supported groups, most preferred first.
pub const DEFAULT_CURVES: &[&str] = &["X25519", "P-256", "P-384"];

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

/// One acceptable transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsProfile {
    /// Short label for logs.
    pub name: String,
    /// `false` only for the cleartext profile.
    pub tls: bool,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    /// TLS 1.2 and below cipher suites, in order. Empty means library default.
    pub cipher_list: Vec<String>,
    /// Supported groups, in order. Empty means library default.
    pub curves: Vec<String>,
}

impl TlsProfile {
    /// TLS 1.2 and 1.3 with modern AEAD suites.
    pub fn modern() -> Self {
        Self {
            name: "modern".to_string(),
            tls: true,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_list: to_owned(MODERN_CIPHER_SUITES),
            curves: to_owned(DEFAULT_CURVES),
        }
    }

    /// TLS 1.0 through 1.3 with a broader suite list.
    pub fn compatible() -> Self {
        Self {
            name: "compatible".to_string(),
            tls: true,
            min_version: TlsVersion::Tls10,
            max_version: TlsVersion::Tls13,
            cipher_list: to_owned(COMPATIBLE_CIPHER_SUITES),
            curves: to_owned(DEFAULT_CURVES),
        }
    }

    /// Unencrypted, unauthenticated connections for `http` endpoints.
    pub fn cleartext() -> Self {
        Self {
            name: "cleartext".to_string(),
            tls: false,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_list: Vec::new(),
            curves: Vec::new(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

fn to_owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
