//! Domain registry: canonical FQDN → entry index with atomic whole-map
//! replacement.
//!
//! The registry is rebuilt from every accepted configuration snapshot and
//! swapped in one atomic pointer store. In-flight lookups see either the
//! old or the new complete map, never a mix; a build failure installs
//! nothing and leaves the previous map serving.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::info;

use crate::backend::Backend;
use crate::config::{CheckSpec, Config};
use crate::router::{Router, RouterDeps};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("domain {domain}: references unknown region: {region}")]
    UnknownRegion { domain: String, region: String },

    #[error("domain {domain}: no servers after region expansion")]
    EmptyDomain { domain: String },

    #[error("region {region}: invalid server address: {address}")]
    InvalidAddress { region: String, address: String },
}

/// Registry record for one FQDN. Immutable once registered; the owning
/// router lives and dies with the entry.
#[derive(Debug)]
pub struct DomainEntry {
    /// Canonical name (lowercase, trailing dot)
    pub fqdn: String,
    pub ttl: u32,
    /// Flattened server set in configured order (regions in domain order,
    /// servers in region order)
    pub servers: Vec<Backend>,
    pub router: Router,
}

/// Canonical form: lowercase with a trailing dot. Idempotent.
pub fn canonicalize(name: &str) -> String {
    let trimmed = name.trim();
    let mut canonical = trimmed.to_ascii_lowercase();
    if !canonical.ends_with('.') {
        canonical.push('.');
    }
    canonical
}

#[derive(Default)]
pub struct Registry {
    entries: ArcSwap<HashMap<String, Arc<DomainEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Add or replace a single entry (initial build path).
    pub fn register(&self, entry: DomainEntry) {
        let entry = Arc::new(entry);
        self.entries.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.insert(entry.fqdn.clone(), entry.clone());
            next
        });
    }

    /// Canonicalize and resolve. Lock-free read of the current map.
    pub fn lookup(&self, fqdn: &str) -> Option<Arc<DomainEntry>> {
        let canonical = canonicalize(fqdn);
        self.entries.load().get(&canonical).cloned()
    }

    pub fn domains(&self) -> Vec<String> {
        self.entries.load().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.entries.load().len()
    }

    /// Swap the whole index to `entries`. Old entries (and their routers)
    /// are released in bulk once the last in-flight reader drops them.
    pub fn replace_all(&self, entries: Vec<DomainEntry>) {
        let map: HashMap<String, Arc<DomainEntry>> = entries
            .into_iter()
            .map(|e| (e.fqdn.clone(), Arc::new(e)))
            .collect();
        let count = map.len();
        self.entries.store(Arc::new(map));
        info!(domains = count, "Registry replaced");
    }
}

/// Materialize one region's server list.
fn region_backends(
    region_name: &str,
    config: &Config,
) -> Result<Option<Vec<Backend>>, RegistryError> {
    let Some(region) = config.regions.iter().find(|r| r.name == region_name) else {
        return Ok(None);
    };

    let mut backends = Vec::with_capacity(region.servers.len());
    for server in &region.servers {
        let address = server
            .address
            .parse()
            .map_err(|_| RegistryError::InvalidAddress {
                region: region.name.clone(),
                address: server.address.clone(),
            })?;
        backends.push(Backend {
            address,
            port: server.port,
            weight: server.weight,
            region: region.name.clone(),
            host: server.host.clone(),
        });
    }
    Ok(Some(backends))
}

/// Build the full entry set from a validated snapshot. All-or-nothing: any
/// bad reference aborts the build and nothing is installed.
pub fn build_entries(
    config: &Config,
    deps: &RouterDeps,
) -> Result<Vec<DomainEntry>, RegistryError> {
    let mut entries = Vec::with_capacity(config.domains.len());

    for domain in &config.domains {
        let mut servers = Vec::new();
        let mut seen = HashSet::new();

        for region_name in &domain.regions {
            let backends = region_backends(region_name, config)?.ok_or_else(|| {
                RegistryError::UnknownRegion {
                    domain: domain.name.clone(),
                    region: region_name.clone(),
                }
            })?;
            for backend in backends {
                // A backend listed in two referenced regions answers once
                if seen.insert(backend.id()) {
                    servers.push(backend);
                }
            }
        }

        if servers.is_empty() {
            return Err(RegistryError::EmptyDomain {
                domain: domain.name.clone(),
            });
        }

        entries.push(DomainEntry {
            fqdn: canonicalize(&domain.name),
            ttl: domain.ttl.unwrap_or(config.dns.default_ttl),
            servers,
            router: Router::new(
                domain.routing_algorithm,
                deps,
                domain.fallback_region.clone(),
            ),
        });
    }

    Ok(entries)
}

/// The backend set the health manager should probe for this snapshot:
/// every server of every region, with its region's check spec.
pub fn backend_targets(config: &Config) -> Result<Vec<(Backend, CheckSpec)>, RegistryError> {
    let mut targets = Vec::new();
    let mut seen = HashSet::new();
    for region in &config.regions {
        if let Some(backends) = region_backends(&region.name, config)? {
            for backend in backends {
                if seen.insert(backend.id()) {
                    targets.push((backend, region.health_check.clone()));
                }
            }
        }
    }
    Ok(targets)
}
