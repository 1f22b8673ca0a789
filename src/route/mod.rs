//! Route candidates: the concrete (proxy, address) pairs tried for an endpoint.
//!
//! Proxy choices are tried in selector order; within a proxy choice, addresses
//! are tried in resolver order. A proxy choice whose name fails to resolve is
//! skipped.

pub mod proxy;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub use proxy::{
    BasicProxyAuth, Credentials, NoProxy, NoProxyAuth, Proxy, ProxyAddr, ProxyAuthenticator,
    ProxyChallenge, ProxySelector, StaticProxySelector,
};

use crate::endpoint::EndpointIdentity;
use crate::error::{Error, Result};

/// One concrete connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCandidate {
    /// Proxy choice this attempt goes through.
    pub proxy: Proxy,
    /// Socket address to connect to: the destination's for direct routes, the
    /// proxy's otherwise.
    pub addr: SocketAddr,
    /// Position in the fallback sequence, starting at 0.
    pub index: usize,
}

impl RouteCandidate {
    /// Secure destinations behind an HTTP proxy need a `CONNECT` tunnel.
    pub fn requires_tunnel(&self, identity: &EndpointIdentity) -> bool {
        identity.is_secure() && matches!(self.proxy, Proxy::Http(_))
    }
}

impl fmt::Display for RouteCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} via {}", self.index, self.addr, self.proxy)
    }
}

/// Lazy, finite, restartable sequence of [`RouteCandidate`]s for one endpoint.
///
/// Performs name resolution and nothing else; it never opens sockets.
pub struct RouteEnumerator {
    identity: EndpointIdentity,
    resolve_timeout: Option<Duration>,
    proxies: Option<VecDeque<Proxy>>,
    current: Option<Proxy>,
    pending: VecDeque<SocketAddr>,
    next_index: usize,
    last_error: Option<Error>,
}

impl RouteEnumerator {
    pub fn new(identity: EndpointIdentity) -> Self {
        Self {
            identity,
            resolve_timeout: None,
            proxies: None,
            current: None,
            pending: VecDeque::new(),
            next_index: 0,
            last_error: None,
        }
    }

    /// Bound each resolver call.
    pub fn with_resolve_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    /// Start over from the first proxy choice, consulting the selector again.
    pub fn restart(&mut self) {
        self.proxies = None;
        self.current = None;
        self.pending.clear();
        self.next_index = 0;
        self.last_error = None;
    }

    /// Most recent resolution failure, if any proxy choice was skipped.
    pub fn take_last_error(&mut self) -> Option<Error> {
        self.last_error.take()
    }

    /// Next candidate, or `None` once every proxy choice is used up.
    pub async fn next(&mut self) -> Option<RouteCandidate> {
        loop {
            if let Some(addr) = self.pending.pop_front() {
                let proxy = self.current.clone().unwrap_or(Proxy::Direct);
                let candidate = RouteCandidate {
                    proxy,
                    addr,
                    index: self.next_index,
                };
                self.next_index += 1;
                return Some(candidate);
            }

            let proxy = self.next_proxy()?;
            match self.resolve(&proxy).await {
                Ok(addrs) => {
                    tracing::trace!(
                        "Routes: {} resolved to {} address(es) via {}",
                        self.identity.authority(),
                        addrs.len(),
                        proxy
                    );
                    self.pending = addrs.into();
                    self.current = Some(proxy);
                }
                Err(e) => {
                    tracing::debug!(
                        "Routes: skipping {} for {}: {}",
                        proxy,
                        self.identity.authority(),
                        e
                    );
                    self.last_error = Some(e);
                }
            }
        }
    }

    fn next_proxy(&mut self) -> Option<Proxy> {
        let identity = &self.identity;
        let proxies = self.proxies.get_or_insert_with(|| {
            let choices = match identity.proxy() {
                Some(fixed) => vec![fixed.clone()],
                None => identity
                    .proxy_selector()
                    .select(identity.host(), identity.port()),
            };
            if choices.is_empty() {
                VecDeque::from([Proxy::Direct])
            } else {
                choices.into()
            }
        });
        proxies.pop_front()
    }

    async fn resolve(&self, proxy: &Proxy) -> Result<Vec<SocketAddr>> {
        let (host, port) = match proxy {
            Proxy::Direct => (self.identity.host(), self.identity.port()),
            Proxy::Http(addr) => (addr.host.as_str(), addr.port),
        };

        let lookup = self.identity.resolver().resolve(host);
        let ips = match self.resolve_timeout {
            Some(limit) => tokio::time::timeout(limit, lookup).await.map_err(|_| {
                Error::resolution(host, format!("timed out after {:?}", limit))
            })??,
            None => lookup.await?,
        };

        if ips.is_empty() {
            return Err(Error::resolution(host, "no addresses"));
        }
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}
