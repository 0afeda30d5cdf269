//! Configuration snapshot for the load balancer.
//!
//! A snapshot describes the DNS listener, the backend regions with their
//! health-check cadence, and the domains served. Snapshots are validated as
//! a whole before they reach the core; a snapshot that fails validation is
//! rejected and the previously applied one stays in effect.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

mod duration;

pub use duration::parse_duration;

/// Validation failures for a configuration snapshot.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid listen address: {0}")]
    InvalidListenAddress(String),

    #[error("duplicate region name: {0}")]
    DuplicateRegion(String),

    #[error("region {region}: invalid server address: {address}")]
    InvalidAddress { region: String, address: String },

    #[error("region {region}: duplicate server {address}:{port}")]
    DuplicateServer {
        region: String,
        address: String,
        port: u16,
    },

    #[error("region {region}: server weight {weight} out of range 1..=1000")]
    InvalidWeight { region: String, weight: u16 },

    #[error("region {region}: health check interval must be at least 1s")]
    IntervalTooShort { region: String },

    #[error("region {region}: health check timeout must be at least 100ms")]
    TimeoutTooShort { region: String },

    #[error("region {region}: health check timeout must be shorter than the interval")]
    TimeoutNotBelowInterval { region: String },

    #[error("region {region}: {which} threshold {value} out of range 1..=10")]
    InvalidThreshold {
        region: String,
        which: &'static str,
        value: u32,
    },

    #[error("region {region}: http health check path must begin with '/': {path}")]
    InvalidCheckPath { region: String, path: String },

    #[error("domain {domain}: references unknown region: {region}")]
    UnknownRegion { domain: String, region: String },

    #[error("domain {domain}: no servers after region expansion")]
    EmptyDomain { domain: String },

    #[error("domain {domain}: ttl {ttl} out of range 1..=86400")]
    InvalidTtl { domain: String, ttl: u32 },

    #[error("domain {domain}: fallback region {region} is not among its regions")]
    FallbackNotReferenced { domain: String, region: String },

    #[error("invalid geo prefix: {0}")]
    InvalidGeoPrefix(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Address the UDP and TCP listeners bind to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// TTL applied to answers for domains without their own ttl
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,
    /// Serve the last known healthy set when every candidate is unhealthy
    #[serde(default)]
    pub return_last_healthy: bool,
    /// Maximum number of queries processed concurrently
    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,
    /// Grace period for in-flight queries and probe workers on shutdown
    #[serde(default = "default_shutdown_grace", with = "duration")]
    pub shutdown_grace: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            default_ttl: default_ttl(),
            return_last_healthy: false,
            query_concurrency: default_query_concurrency(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:53".to_string()
}

fn default_ttl() -> u32 {
    60
}

fn default_query_concurrency() -> usize {
    1024
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable the admin listener (/metrics, /healthz, /status)
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
    #[serde(default = "default_admin_listen_address")]
    pub listen_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: default_admin_enabled(),
            listen_address: default_admin_listen_address(),
        }
    }
}

fn default_admin_enabled() -> bool {
    true
}

fn default_admin_listen_address() -> String {
    "127.0.0.1:8053".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Static client-IP → region mapping used by the geolocation router.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeoConfig {
    #[serde(default)]
    pub prefixes: Vec<GeoPrefixConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeoPrefixConfig {
    /// CIDR prefix, e.g. "203.0.113.0/24" or "2001:db8::/32"
    pub cidr: String,
    /// Region name clients in this prefix map to
    pub region: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionConfig {
    pub name: String,
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub health_check: CheckSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Backend IP address (names are not resolved at query time)
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u16,
    /// Optional Host header / SNI override for HTTP(S) probes
    #[serde(default)]
    pub host: Option<String>,
}

fn default_weight() -> u16 {
    100
}

/// Probe cadence and hysteresis for every server in a region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CheckSpec {
    #[serde(rename = "type", default = "default_check_scheme")]
    pub scheme: CheckScheme,
    /// Request path for http/https probes
    #[serde(default = "default_check_path")]
    pub path: String,
    #[serde(default = "default_check_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default = "default_check_timeout", with = "duration")]
    pub timeout: Duration,
    /// Consecutive failures before a backend is marked unhealthy
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    /// Consecutive passes before a backend is marked healthy
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u32,
    /// Skip certificate validation for https probes
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for CheckSpec {
    fn default() -> Self {
        Self {
            scheme: default_check_scheme(),
            path: default_check_path(),
            interval: default_check_interval(),
            timeout: default_check_timeout(),
            fail_threshold: default_fail_threshold(),
            pass_threshold: default_pass_threshold(),
            insecure_skip_verify: false,
        }
    }
}

fn default_check_scheme() -> CheckScheme {
    CheckScheme::Tcp
}

fn default_check_path() -> String {
    "/".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_fail_threshold() -> u32 {
    3
}

fn default_pass_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckScheme {
    Http,
    Https,
    Tcp,
}

impl CheckScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckScheme::Http => "http",
            CheckScheme::Https => "https",
            CheckScheme::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingAlgorithm {
    RoundRobin,
    Weighted,
    Failover,
    Geolocation,
    Latency,
}

impl RoutingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingAlgorithm::RoundRobin => "round-robin",
            RoutingAlgorithm::Weighted => "weighted",
            RoutingAlgorithm::Failover => "failover",
            RoutingAlgorithm::Geolocation => "geolocation",
            RoutingAlgorithm::Latency => "latency",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainConfig {
    /// FQDN this entry answers for (canonicalized on registry build)
    pub name: String,
    #[serde(default = "default_routing_algorithm")]
    pub routing_algorithm: RoutingAlgorithm,
    /// Regions whose servers back this domain, in failover order
    pub regions: Vec<String>,
    /// Per-domain TTL override
    #[serde(default)]
    pub ttl: Option<u32>,
    /// Region the geolocation router falls back to when the client's
    /// region has no healthy candidates
    #[serde(default)]
    pub fallback_region: Option<String>,
}

fn default_routing_algorithm() -> RoutingAlgorithm {
    RoutingAlgorithm::RoundRobin
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse configuration file")?;
        config
            .validate()
            .with_context(|| "Configuration failed validation")?;
        Ok(config)
    }

    /// Check the whole snapshot. Nothing from a snapshot that fails here may
    /// reach the registry or the health manager.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dns
            .listen_address
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListenAddress(self.dns.listen_address.clone()))?;

        let mut region_names = HashSet::new();
        for region in &self.regions {
            if !region_names.insert(region.name.as_str()) {
                return Err(ConfigError::DuplicateRegion(region.name.clone()));
            }
            validate_check_spec(&region.name, &region.health_check)?;

            let mut seen = HashSet::new();
            for server in &region.servers {
                let ip: IpAddr =
                    server
                        .address
                        .parse()
                        .map_err(|_| ConfigError::InvalidAddress {
                            region: region.name.clone(),
                            address: server.address.clone(),
                        })?;
                if !seen.insert((ip, server.port)) {
                    return Err(ConfigError::DuplicateServer {
                        region: region.name.clone(),
                        address: server.address.clone(),
                        port: server.port,
                    });
                }
                if server.weight == 0 || server.weight > 1000 {
                    return Err(ConfigError::InvalidWeight {
                        region: region.name.clone(),
                        weight: server.weight,
                    });
                }
            }
        }

        for domain in &self.domains {
            let mut server_count = 0;
            for region in &domain.regions {
                match self.regions.iter().find(|r| &r.name == region) {
                    Some(r) => server_count += r.servers.len(),
                    None => {
                        return Err(ConfigError::UnknownRegion {
                            domain: domain.name.clone(),
                            region: region.clone(),
                        })
                    }
                }
            }
            if server_count == 0 {
                return Err(ConfigError::EmptyDomain {
                    domain: domain.name.clone(),
                });
            }
            if let Some(ttl) = domain.ttl {
                if ttl == 0 || ttl > 86_400 {
                    return Err(ConfigError::InvalidTtl {
                        domain: domain.name.clone(),
                        ttl,
                    });
                }
            }
            if let Some(fallback) = &domain.fallback_region {
                if !domain.regions.contains(fallback) {
                    return Err(ConfigError::FallbackNotReferenced {
                        domain: domain.name.clone(),
                        region: fallback.clone(),
                    });
                }
            }
        }

        if self.dns.default_ttl == 0 || self.dns.default_ttl > 86_400 {
            return Err(ConfigError::InvalidTtl {
                domain: "(default)".to_string(),
                ttl: self.dns.default_ttl,
            });
        }

        for prefix in &self.geo.prefixes {
            crate::geo::parse_prefix(&prefix.cidr)
                .map_err(|_| ConfigError::InvalidGeoPrefix(prefix.cidr.clone()))?;
        }

        Ok(())
    }
}

fn validate_check_spec(region: &str, spec: &CheckSpec) -> Result<(), ConfigError> {
    if spec.interval < Duration::from_secs(1) {
        return Err(ConfigError::IntervalTooShort {
            region: region.to_string(),
        });
    }
    if spec.timeout < Duration::from_millis(100) {
        return Err(ConfigError::TimeoutTooShort {
            region: region.to_string(),
        });
    }
    if spec.timeout >= spec.interval {
        return Err(ConfigError::TimeoutNotBelowInterval {
            region: region.to_string(),
        });
    }
    for (which, value) in [
        ("fail", spec.fail_threshold),
        ("pass", spec.pass_threshold),
    ] {
        if value == 0 || value > 10 {
            return Err(ConfigError::InvalidThreshold {
                region: region.to_string(),
                which,
                value,
            });
        }
    }
    if matches!(spec.scheme, CheckScheme::Http | CheckScheme::Https)
        && !spec.path.starts_with('/')
    {
        return Err(ConfigError::InvalidCheckPath {
            region: region.to_string(),
            path: spec.path.clone(),
        });
    }
    Ok(())
}
