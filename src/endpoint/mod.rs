//! Endpoint identity: everything that decides whether two requests may share a
//! connection.
//!
//! Request path, query and headers never take part. Two identities are equal
//! when host, port and scheme match and every capability, protocol list, TLS
//! profile list and proxy setting compares equal (see [`Cap`]).

pub mod capability;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub use capability::{Cap, CapabilityEq};

use crate::error::{Error, Result};
use crate::protocol::{self, Protocol};
use crate::route::{Proxy, ProxyAuthenticator, ProxySelector};
use crate::transport::profile::TlsProfile;
use crate::transport::resolver::Resolver;
use crate::transport::tcp::SocketFactory;
use crate::transport::tls::SecureTransportFactory;
use crate::transport::verify::{CertificatePinner, HostnameVerifier};

/// Transport security of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP ("http").
    Http,
    /// TLS ("https").
    Https,
}

impl Scheme {
    /// Parse a URI scheme.
    pub fn parse(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if scheme.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Https)
    }

    /// Port used when the request target does not name one.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct Fields {
    host: String,
    port: u16,
    scheme: Scheme,
    resolver: Cap<dyn Resolver>,
    socket_factory: Cap<dyn SocketFactory>,
    proxy_authenticator: Cap<dyn ProxyAuthenticator>,
    protocols: Vec<Protocol>,
    tls_profiles: Vec<TlsProfile>,
    proxy_selector: Cap<dyn ProxySelector>,
    proxy: Option<Proxy>,
    secure_transport: Option<Cap<dyn SecureTransportFactory>>,
    hostname_verifier: Option<Cap<dyn HostnameVerifier>>,
    certificate_pinner: Option<Cap<dyn CertificatePinner>>,
}

/// Immutable connection-compatibility key for one destination.
///
/// Cheap to clone. The hash is computed once at construction, so using the
/// identity as a pool key does not rehash every capability on each lookup.
#[derive(Clone)]
pub struct EndpointIdentity {
    fields: Arc<Fields>,
    hash: u64,
}

impl EndpointIdentity {
    /// Start building an identity for `host:port` over `scheme`.
    pub fn builder(host: impl Into<String>, port: u16, scheme: Scheme) -> EndpointBuilder {
        EndpointBuilder::new(host.into(), port, scheme)
    }

    pub fn host(&self) -> &str {
        &self.fields.host
    }

    pub fn port(&self) -> u16 {
        self.fields.port
    }

    pub fn scheme(&self) -> Scheme {
        self.fields.scheme
    }

    pub fn is_secure(&self) -> bool {
        self.fields.scheme.is_secure()
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.fields.host.contains(':') {
            format!("[{}]:{}", self.fields.host, self.fields.port)
        } else {
            format!("{}:{}", self.fields.host, self.fields.port)
        }
    }

    pub fn resolver(&self) -> &dyn Resolver {
        &*self.fields.resolver
    }

    pub fn socket_factory(&self) -> &dyn SocketFactory {
        &*self.fields.socket_factory
    }

    pub fn proxy_authenticator(&self) -> &dyn ProxyAuthenticator {
        &*self.fields.proxy_authenticator
    }

    pub fn proxy_selector(&self) -> &dyn ProxySelector {
        &*self.fields.proxy_selector
    }

    /// Acceptable application protocols, most preferred first.
    pub fn protocols(&self) -> &[Protocol] {
        &self.fields.protocols
    }

    /// Acceptable TLS profiles, most preferred first.
    pub fn tls_profiles(&self) -> &[TlsProfile] {
        &self.fields.tls_profiles
    }

    /// Proxy pinned by the caller. When set, the proxy selector is not consulted.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.fields.proxy.as_ref()
    }

    pub fn secure_transport(&self) -> Option<&dyn SecureTransportFactory> {
        self.fields.secure_transport.as_deref()
    }

    pub fn hostname_verifier(&self) -> Option<&dyn HostnameVerifier> {
        self.fields.hostname_verifier.as_deref()
    }

    pub fn certificate_pinner(&self) -> Option<&dyn CertificatePinner> {
        self.fields.certificate_pinner.as_deref()
    }

    /// Check whether a connection built for `other` may serve this identity.
    pub fn is_equivalent(&self, other: &EndpointIdentity) -> bool {
        self == other
    }
}

impl PartialEq for EndpointIdentity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
            || (self.hash == other.hash && self.fields == other.fields)
    }
}

impl Eq for EndpointIdentity {}

impl Hash for EndpointIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointIdentity")
            .field("scheme", &self.fields.scheme)
            .field("host", &self.fields.host)
            .field("port", &self.fields.port)
            .field("protocols", &self.fields.protocols)
            .field("proxy", &self.fields.proxy)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.fields.scheme.as_str(), self.authority())?;
        match &self.fields.proxy {
            Some(proxy) => write!(f, " via {}", proxy),
            None => Ok(()),
        }
    }
}

/// Builder for [`EndpointIdentity`].
///
/// No capability has a default here: a missing resolver, socket factory, proxy
/// authenticator or proxy selector is a configuration error. Client-wide
/// defaults live in [`crate::ClientConfig`].
#[derive(Debug)]
pub struct EndpointBuilder {
    host: String,
    port: u16,
    scheme: Scheme,
    resolver: Option<Cap<dyn Resolver>>,
    socket_factory: Option<Cap<dyn SocketFactory>>,
    proxy_authenticator: Option<Cap<dyn ProxyAuthenticator>>,
    proxy_selector: Option<Cap<dyn ProxySelector>>,
    protocols: Vec<Protocol>,
    tls_profiles: Vec<TlsProfile>,
    proxy: Option<Proxy>,
    secure_transport: Option<Cap<dyn SecureTransportFactory>>,
    hostname_verifier: Option<Cap<dyn HostnameVerifier>>,
    certificate_pinner: Option<Cap<dyn CertificatePinner>>,
}

impl EndpointBuilder {
    fn new(host: String, port: u16, scheme: Scheme) -> Self {
        Self {
            host,
            port,
            scheme,
            resolver: None,
            socket_factory: None,
            proxy_authenticator: None,
            proxy_selector: None,
            protocols: Vec::new(),
            tls_profiles: Vec::new(),
            proxy: None,
            secure_transport: None,
            hostname_verifier: None,
            certificate_pinner: None,
        }
    }

    pub fn resolver(mut self, resolver: Cap<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn socket_factory(mut self, factory: Cap<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Cap<dyn ProxyAuthenticator>) -> Self {
        self.proxy_authenticator = Some(authenticator);
        self
    }

    pub fn proxy_selector(mut self, selector: Cap<dyn ProxySelector>) -> Self {
        self.proxy_selector = Some(selector);
        self
    }

    pub fn protocols(mut self, protocols: impl Into<Vec<Protocol>>) -> Self {
        self.protocols = protocols.into();
        self
    }

    pub fn tls_profiles(mut self, profiles: impl Into<Vec<TlsProfile>>) -> Self {
        self.tls_profiles = profiles.into();
        self
    }

    pub fn proxy(mut self, proxy: Option<Proxy>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn secure_transport(mut self, factory: Cap<dyn SecureTransportFactory>) -> Self {
        self.secure_transport = Some(factory);
        self
    }

    pub fn hostname_verifier(mut self, verifier: Cap<dyn HostnameVerifier>) -> Self {
        self.hostname_verifier = Some(verifier);
        self
    }

    pub fn certificate_pinner(mut self, pinner: Cap<dyn CertificatePinner>) -> Self {
        self.certificate_pinner = Some(pinner);
        self
    }

    /// Validate and freeze the identity.
    pub fn build(self) -> Result<EndpointIdentity> {
        let host = normalize_host(&self.host)?;
        if self.port == 0 {
            return Err(Error::config(format!("invalid port 0 for {}", host)));
        }

        let resolver = self.resolver.ok_or_else(|| Error::config("resolver is required"))?;
        let socket_factory = self
            .socket_factory
            .ok_or_else(|| Error::config("socket factory is required"))?;
        let proxy_authenticator = self
            .proxy_authenticator
            .ok_or_else(|| Error::config("proxy authenticator is required"))?;
        let proxy_selector = self
            .proxy_selector
            .ok_or_else(|| Error::config("proxy selector is required"))?;

        validate_protocols(&self.protocols, self.scheme)?;

        let (secure_transport, hostname_verifier, certificate_pinner) = if self.scheme.is_secure() {
            let factory = self.secure_transport.ok_or_else(|| {
                Error::config("secure transport factory is required for https endpoints")
            })?;
            let verifier = self.hostname_verifier.ok_or_else(|| {
                Error::config("hostname verifier is required for https endpoints")
            })?;
            if !self.tls_profiles.iter().any(TlsProfile::is_tls) {
                return Err(Error::config("no TLS profile configured for https endpoint"));
            }
            (Some(factory), Some(verifier), self.certificate_pinner)
        } else {
            if !self.tls_profiles.iter().any(|p| !p.is_tls()) {
                return Err(Error::config(format!(
                    "cleartext communication to {} is not enabled",
                    host
                )));
            }
            (None, None, None)
        };

        let fields = Fields {
            host,
            port: self.port,
            scheme: self.scheme,
            resolver,
            socket_factory,
            proxy_authenticator,
            protocols: self.protocols,
            tls_profiles: self.tls_profiles,
            proxy_selector,
            proxy: self.proxy,
            secure_transport,
            hostname_verifier,
            certificate_pinner,
        };

        let mut hasher = DefaultHasher::new();
        fields.hash(&mut hasher);
        Ok(EndpointIdentity {
            hash: hasher.finish(),
            fields: Arc::new(fields),
        })
    }
}

fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return Err(Error::config("host must not be empty"));
    }
    Ok(host.to_ascii_lowercase())
}

fn validate_protocols(protocols: &[Protocol], scheme: Scheme) -> Result<()> {
    if protocols.is_empty() {
        return Err(Error::config("protocol list must not be empty"));
    }
    for (i, p) in protocols.iter().enumerate() {
        if protocols[..i].contains(p) {
            return Err(Error::config(format!("duplicate protocol {}", p)));
        }
    }
    if protocols.contains(&Protocol::H2PriorKnowledge) && protocols.len() > 1 {
        return Err(Error::config(format!(
            "h2_prior_knowledge cannot be combined with other protocols: [{}]",
            protocol::describe(protocols)
        )));
    }
    let usable = if scheme.is_secure() {
        protocols.iter().any(|p| p.alpn_id().is_some())
    } else {
        protocols.iter().any(Protocol::allows_cleartext)
    };
    if !usable {
        return Err(Error::config(format!(
            "none of [{}] can be used over {}",
            protocol::describe(protocols),
            scheme.as_str()
        )));
    }
    Ok(())
}
