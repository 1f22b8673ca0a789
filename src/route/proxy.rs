//! Proxy choices, proxy selection and proxy authentication.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::endpoint::CapabilityEq;

/// Address of a proxy server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One way of reaching a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect straight to the destination's own addresses.
    Direct,
    /// Connect to an HTTP proxy. Secure destinations are reached through a
    /// `CONNECT` tunnel.
    Http(ProxyAddr),
}

impl Proxy {
    /// HTTP proxy at `host:port`.
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http(ProxyAddr {
            host: host.into(),
            port,
        })
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("DIRECT"),
            Self::Http(addr) => write!(f, "HTTP {}", addr),
        }
    }
}

/// Chooses proxies for a destination.
pub trait ProxySelector: CapabilityEq {
    /// Ordered proxy choices for `host:port`. [`Proxy::Direct`] is a valid
    /// entry; an empty list means direct.
    fn select(&self, host: &str, port: u16) -> Vec<Proxy>;
}

/// Always connect directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _host: &str, _port: u16) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// Same proxy list for every destination, with optional direct-only hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StaticProxySelector {
    proxies: Vec<Proxy>,
    bypass: Vec<String>,
}

impl StaticProxySelector {
    pub fn new(proxies: impl Into<Vec<Proxy>>) -> Self {
        Self {
            proxies: proxies.into(),
            bypass: Vec::new(),
        }
    }

    /// Connect directly to `host` and its subdomains.
    pub fn bypass(mut self, host: impl Into<String>) -> Self {
        self.bypass.push(host.into().to_ascii_lowercase());
        self
    }

    fn bypasses(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.bypass.iter().any(|b| {
            host == *b
                || host
                    .strip_suffix(b.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl ProxySelector for StaticProxySelector {
    fn select(&self, host: &str, _port: u16) -> Vec<Proxy> {
        if self.bypasses(host) {
            vec![Proxy::Direct]
        } else {
            self.proxies.clone()
        }
    }
}

/// Proxy response demanding credentials (`407 Proxy Authentication Required`).
#[derive(Debug, Clone)]
pub struct ProxyChallenge {
    /// Proxy that issued the challenge.
    pub proxy: ProxyAddr,
    /// Tunnel target, `host:port`.
    pub target: String,
    /// `Proxy-Authenticate` header values, in order.
    pub challenges: Vec<String>,
    /// Credentials already sent on the rejected attempt.
    pub prior: Option<Credentials>,
}

/// `Proxy-Authorization` header value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials(String);

impl Credentials {
    /// Raw header value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `Basic` credentials (RFC 7617).
    pub fn basic(user: &str, password: &str) -> Self {
        Self(format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", user, password))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(..)")
    }
}

/// Supplies credentials when a proxy demands them.
pub trait ProxyAuthenticator: CapabilityEq {
    /// Credentials to retry with, or `None` to give up.
    fn authenticate(&self, challenge: &ProxyChallenge) -> Option<Credentials>;
}

/// Never answers proxy challenges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NoProxyAuth;

impl ProxyAuthenticator for NoProxyAuth {
    fn authenticate(&self, _challenge: &ProxyChallenge) -> Option<Credentials> {
        None
    }
}

/// Answers `Basic` challenges with fixed credentials, once per tunnel.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BasicProxyAuth {
    credentials: Credentials,
}

impl BasicProxyAuth {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            credentials: Credentials::basic(user, password),
        }
    }
}

impl fmt::Debug for BasicProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicProxyAuth").finish_non_exhaustive()
    }
}

impl ProxyAuthenticator for BasicProxyAuth {
    fn authenticate(&self, challenge: &ProxyChallenge) -> Option<Credentials> {
        // Same credentials were already rejected.
        if challenge.prior.as_ref() == Some(&self.credentials) {
            return None;
        }
        let offers_basic = challenge.challenges.is_empty()
            || challenge.challenges.iter().any(|c| {
                c.split_whitespace()
                    .next()
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic"))
            });
        offers_basic.then(|| self.credentials.clone())
    }
}
