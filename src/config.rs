//! Client-wide configuration: the capability set every endpoint identity is
//! built from.
//!
//! # Usage
//!
//! ```rust
//! use linkpool::{ClientConfig, Protocol, Timeouts};
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .protocols(vec![Protocol::Http11])
//!     .timeouts(Timeouts::defaults().connect(Duration::from_secs(3)))
//!     .build();
//! let identity = config
//!     .identity_for(&"https://example.com/index.html".parse().unwrap())
//!     .unwrap();
//! assert_eq!(identity.authority(), "example.com:443");
//! ```

use std::sync::Arc;

use http::Uri;

use crate::endpoint::{Cap, EndpointIdentity, Scheme};
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::route::{NoProxy, NoProxyAuth, Proxy, ProxyAuthenticator, ProxySelector};
use crate::timeouts::Timeouts;
use crate::transport::profile::TlsProfile;
use crate::transport::resolver::{Resolver, SystemResolver};
use crate::transport::tcp::{SocketFactory, TcpSocketFactory};
use crate::transport::tls::{BoringTlsFactory, SecureTransportFactory};
use crate::transport::verify::{CertificatePinner, DefaultHostnameVerifier, HostnameVerifier, PinSet};

/// Capabilities, protocol preferences and timeouts shared by every request
/// of one client.
///
/// Two configurations built separately with equal settings produce
/// equivalent identities, so their requests share pooled connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    resolver: Cap<dyn Resolver>,
    socket_factory: Cap<dyn SocketFactory>,
    proxy_authenticator: Cap<dyn ProxyAuthenticator>,
    proxy_selector: Cap<dyn ProxySelector>,
    proxy: Option<Proxy>,
    secure_transport: Cap<dyn SecureTransportFactory>,
    hostname_verifier: Cap<dyn HostnameVerifier>,
    certificate_pinner: Cap<dyn CertificatePinner>,
    protocols: Vec<Protocol>,
    tls_profiles: Vec<TlsProfile>,
    timeouts: Timeouts,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn tls_profiles(&self) -> &[TlsProfile] {
        &self.tls_profiles
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// Identity for a request target. Only scheme, host and port are used.
    pub fn identity_for(&self, uri: &Uri) -> Result<EndpointIdentity> {
        let scheme_str = uri
            .scheme_str()
            .ok_or_else(|| Error::invalid_target(format!("missing scheme: {}", uri)))?;
        let scheme = Scheme::parse(scheme_str)
            .ok_or_else(|| Error::invalid_target(format!("unsupported scheme: {}", scheme_str)))?;
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_target(format!("missing host: {}", uri)))?;
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        self.identity(host, port, scheme)
    }

    /// Identity for an explicit destination.
    pub fn identity(&self, host: &str, port: u16, scheme: Scheme) -> Result<EndpointIdentity> {
        EndpointIdentity::builder(host, port, scheme)
            .resolver(self.resolver.clone())
            .socket_factory(self.socket_factory.clone())
            .proxy_authenticator(self.proxy_authenticator.clone())
            .proxy_selector(self.proxy_selector.clone())
            .proxy(self.proxy.clone())
            .protocols(self.protocols.clone())
            .tls_profiles(self.tls_profiles.clone())
            .secure_transport(self.secure_transport.clone())
            .hostname_verifier(self.hostname_verifier.clone())
            .certificate_pinner(self.certificate_pinner.clone())
            .build()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver);
        let socket_factory: Arc<dyn SocketFactory> = Arc::new(TcpSocketFactory::default());
        let proxy_authenticator: Arc<dyn ProxyAuthenticator> = Arc::new(NoProxyAuth);
        let proxy_selector: Arc<dyn ProxySelector> = Arc::new(NoProxy);
        let secure_transport: Arc<dyn SecureTransportFactory> = Arc::new(BoringTlsFactory::new());
        let hostname_verifier: Arc<dyn HostnameVerifier> = Arc::new(DefaultHostnameVerifier);
        let certificate_pinner: Arc<dyn CertificatePinner> = Arc::new(PinSet::empty());
        Self {
            config: ClientConfig {
                resolver: resolver.into(),
                socket_factory: socket_factory.into(),
                proxy_authenticator: proxy_authenticator.into(),
                proxy_selector: proxy_selector.into(),
                proxy: None,
                secure_transport: secure_transport.into(),
                hostname_verifier: hostname_verifier.into(),
                certificate_pinner: certificate_pinner.into(),
                protocols: vec![Protocol::H2, Protocol::Http11],
                tls_profiles: vec![
                    TlsProfile::modern(),
                    TlsProfile::compatible(),
                    TlsProfile::cleartext(),
                ],
                timeouts: Timeouts::defaults(),
            },
        }
    }
}

impl ClientConfigBuilder {
    pub fn resolver<R: Resolver>(mut self, resolver: R) -> Self {
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);
        self.config.resolver = resolver.into();
        self
    }

    pub fn socket_factory<S: SocketFactory>(mut self, factory: S) -> Self {
        let factory: Arc<dyn SocketFactory> = Arc::new(factory);
        self.config.socket_factory = factory.into();
        self
    }

    pub fn proxy_authenticator<A: ProxyAuthenticator>(mut self, authenticator: A) -> Self {
        let authenticator: Arc<dyn ProxyAuthenticator> = Arc::new(authenticator);
        self.config.proxy_authenticator = authenticator.into();
        self
    }

    /// Consulted for every endpoint unless a fixed proxy is set.
    pub fn proxy_selector<P: ProxySelector>(mut self, selector: P) -> Self {
        let selector: Arc<dyn ProxySelector> = Arc::new(selector);
        self.config.proxy_selector = selector.into();
        self
    }

    /// Route everything through `proxy`, bypassing the selector.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn secure_transport<T: SecureTransportFactory>(mut self, factory: T) -> Self {
        let factory: Arc<dyn SecureTransportFactory> = Arc::new(factory);
        self.config.secure_transport = factory.into();
        self
    }

    pub fn hostname_verifier<V: HostnameVerifier>(mut self, verifier: V) -> Self {
        let verifier: Arc<dyn HostnameVerifier> = Arc::new(verifier);
        self.config.hostname_verifier = verifier.into();
        self
    }

    pub fn certificate_pinner<P: CertificatePinner>(mut self, pinner: P) -> Self {
        let pinner: Arc<dyn CertificatePinner> = Arc::new(pinner);
        self.config.certificate_pinner = pinner.into();
        self
    }

    /// Acceptable application protocols, most preferred first.
    pub fn protocols(mut self, protocols: impl Into<Vec<Protocol>>) -> Self {
        self.config.protocols = protocols.into();
        self
    }

    /// Acceptable TLS profiles, most preferred first. Include
    /// [`TlsProfile::cleartext`] to allow `http` targets.
    pub fn tls_profiles(mut self, profiles: impl Into<Vec<TlsProfile>>) -> Self {
        self.config.tls_profiles = profiles.into();
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
