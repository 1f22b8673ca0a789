//! Name resolution capability.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::endpoint::CapabilityEq;
use crate::error::{Error, Result};

/// Resolves hostnames to addresses.
#[async_trait]
pub trait Resolver: CapabilityEq {
    /// Addresses for `host`, most preferred first.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Operating-system resolver (`getaddrinfo` via tokio).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = lookup_host((host, 0))
            .await
            .map_err(|e| Error::resolution(host, e.to_string()))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        if ips.is_empty() {
            return Err(Error::resolution(host, "no addresses found"));
        }
        Ok(ips)
    }
}

/// Fixed host table. Hosts missing from the table fail to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StaticResolver {
    table: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `addrs`, in the given order.
    pub fn with_host(
        mut self,
        host: impl Into<String>,
        addrs: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        self.table
            .insert(host.into().to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        match self.table.get(&host.to_ascii_lowercase()) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            Some(_) => Err(Error::resolution(host, "no addresses found")),
            None => Err(Error::resolution(host, "no such host")),
        }
    }
}
