use crate::error::{CascadeError, Result};
use async_trait::async_trait;
use std::net::IpAddr;

/// Hostname to address resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// System resolver. Prefers an IPv4 answer when both families are returned,
/// since peers advertise and compare upstreams by IPv4 address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| CascadeError::Resolve(host.to_string()))?
            .map(|addr| addr.ip())
            .collect();
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| CascadeError::Resolve(host.to_string()))
    }
}
