//! Client geolocation capability.
//!
//! The geolocation router asks a [`GeoLookup`] for the region a client IP
//! belongs to. The built-in implementation is a static longest-prefix map
//! loaded from the configuration; deployments with a real GeoIP database
//! plug in their own implementation of the trait.

use std::net::IpAddr;

use crate::config::GeoConfig;

/// Resolves a client address to a region name. May fail (return `None`);
/// the router falls back rather than blocking a query on geolocation.
pub trait GeoLookup: Send + Sync {
    fn region_of(&self, ip: IpAddr) -> Option<String>;
}

/// Lookup that never resolves. Used when no geo mapping is configured.
#[derive(Debug, Default)]
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn region_of(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// A parsed CIDR prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    network: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.len as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.len as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }
}

/// Parse "addr/len" into a [`Prefix`], rejecting out-of-range lengths.
pub fn parse_prefix(cidr: &str) -> Result<Prefix, String> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| format!("missing prefix length: {cidr}"))?;
    let network: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| format!("invalid network address: {cidr}"))?;
    let len: u8 = len
        .trim()
        .parse()
        .map_err(|_| format!("invalid prefix length: {cidr}"))?;
    let max = if network.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(format!("prefix length out of range: {cidr}"));
    }
    Ok(Prefix { network, len })
}

/// Static longest-prefix-match geo map built from configuration.
#[derive(Debug, Default)]
pub struct StaticGeoMap {
    // Sorted by descending prefix length so the first hit wins
    entries: Vec<(Prefix, String)>,
}

impl StaticGeoMap {
    pub fn from_config(config: &GeoConfig) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(config.prefixes.len());
        for p in &config.prefixes {
            entries.push((parse_prefix(&p.cidr)?, p.region.clone()));
        }
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLookup for StaticGeoMap {
    fn region_of(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(prefix, _)| prefix.contains(ip))
            .map(|(_, region)| region.clone())
    }
}
