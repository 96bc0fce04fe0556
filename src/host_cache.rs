//! Hostname -> address cache shared by every connection of a session.

use std::net::{IpAddr, SocketAddr};

use dashmap::DashMap;
use tracing::debug;

use crate::cli::HostCacheMode;
use crate::error::{MgetError, Result};

#[derive(Debug, Default)]
pub struct HostCache {
    mode: HostCacheMode,
    entries: DashMap<String, Vec<IpAddr>>,
}

impl HostCache {
    pub fn new(mode: HostCacheMode) -> Self {
        Self {
            mode,
            entries: DashMap::new(),
        }
    }

    pub fn mode(&self) -> HostCacheMode {
        self.mode
    }

    pub fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.entries.get(host).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seeds an entry, keeping an existing one.
    pub fn insert_if_absent(&self, host: &str, addrs: Vec<IpAddr>) {
        self.entries.entry(host.to_string()).or_insert(addrs);
    }

    /// Addresses for `host:port`, honouring the cache mode.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        if self.mode == HostCacheMode::Default {
            if let Some(ips) = self.cached(host) {
                debug!("host cache hit for {host}");
                return Ok(with_port(&ips, port));
            }
        }

        let ips = lookup(host, port).await?;
        match self.mode {
            HostCacheMode::Bypass => {}
            HostCacheMode::Default => self.insert_if_absent(host, ips.clone()),
            HostCacheMode::Update => {
                self.entries.insert(host.to_string(), ips.clone());
            }
        }
        Ok(with_port(&ips, port))
    }
}

fn with_port(ips: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect()
}

async fn lookup(host: &str, port: u16) -> Result<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| MgetError::Resolve(format!("{host}: {e}")))?;
    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err(MgetError::Resolve(host.to_string()));
    }
    debug!("resolved {host} to {ips:?}");
    Ok(ips)
}
