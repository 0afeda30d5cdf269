//! Per-domain routing strategies.
//!
//! A router picks the answer set from the candidates that survived health
//! filtering. Every domain entry owns its own router instance; only
//! round-robin holds mutable state (its cursor).

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::backend::{Backend, BackendId};
use crate::config::RoutingAlgorithm;
use crate::geo::GeoLookup;

/// Smoothed RTT per backend, supplied by a collaborator (the health
/// manager's probe EWMA by default). `None` means unknown; the latency
/// router falls back rather than guessing.
pub trait LatencyOracle: Send + Sync {
    fn smoothed_latency(&self, id: &BackendId) -> Option<Duration>;
}

/// Oracle that knows nothing. Keeps the latency strategy answering (all
/// candidates) when no latency source is wired.
#[derive(Debug, Default)]
pub struct NoLatency;

impl LatencyOracle for NoLatency {
    fn smoothed_latency(&self, _id: &BackendId) -> Option<Duration> {
        None
    }
}

/// Query-side context for routing decisions.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub client_ip: Option<IpAddr>,
    /// Pre-resolved region, when the caller already knows it (coarse
    /// geo hint); consulted before the geo lookup
    pub region_hint: Option<String>,
}

/// Capabilities routers may consult. Cloned into each router that needs
/// them at registry build time.
#[derive(Clone)]
pub struct RouterDeps {
    pub geo: Arc<dyn GeoLookup>,
    pub latency: Arc<dyn LatencyOracle>,
}

/// Selection strategy. Tagged variant rather than a trait object so new
/// kinds are additions to the enum, caught at the build site.
pub enum Router {
    RoundRobin {
        cursor: Mutex<usize>,
    },
    Weighted,
    Failover,
    Geolocation {
        geo: Arc<dyn GeoLookup>,
        fallback_region: Option<String>,
    },
    Latency {
        oracle: Arc<dyn LatencyOracle>,
    },
}

impl Router {
    pub fn new(
        algorithm: RoutingAlgorithm,
        deps: &RouterDeps,
        fallback_region: Option<String>,
    ) -> Self {
        match algorithm {
            RoutingAlgorithm::RoundRobin => Router::RoundRobin {
                cursor: Mutex::new(0),
            },
            RoutingAlgorithm::Weighted => Router::Weighted,
            RoutingAlgorithm::Failover => Router::Failover,
            RoutingAlgorithm::Geolocation => Router::Geolocation {
                geo: deps.geo.clone(),
                fallback_region,
            },
            RoutingAlgorithm::Latency => Router::Latency {
                oracle: deps.latency.clone(),
            },
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Router::RoundRobin { .. } => "round-robin",
            Router::Weighted => "weighted",
            Router::Failover => "failover",
            Router::Geolocation { .. } => "geolocation",
            Router::Latency { .. } => "latency",
        }
    }

    /// Pick the answer set from already-health-filtered candidates.
    pub fn select(&self, candidates: &[Backend], ctx: &ClientContext) -> Vec<Backend> {
        if candidates.is_empty() {
            return Vec::new();
        }

        match self {
            Router::RoundRobin { cursor } => {
                let mut cursor = cursor.lock();
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                vec![candidates[index].clone()]
            }

            Router::Weighted => {
                // Cumulative-weight search against a uniform sample;
                // weight 0 counts as 1
                let total: u32 = candidates.iter().map(|b| b.weight.max(1) as u32).sum();
                let mut pick = rand::rng().random_range(0..total);
                for candidate in candidates {
                    let weight = candidate.weight.max(1) as u32;
                    if pick < weight {
                        return vec![candidate.clone()];
                    }
                    pick -= weight;
                }
                vec![candidates[candidates.len() - 1].clone()]
            }

            // Candidates arrive in configured order; the first healthy one
            // wins
            Router::Failover => vec![candidates[0].clone()],

            Router::Geolocation {
                geo,
                fallback_region,
            } => {
                let region = ctx
                    .region_hint
                    .clone()
                    .or_else(|| ctx.client_ip.and_then(|ip| geo.region_of(ip)));

                if let Some(region) = region {
                    let matched: Vec<Backend> = candidates
                        .iter()
                        .filter(|b| b.region == region)
                        .cloned()
                        .collect();
                    if !matched.is_empty() {
                        return matched;
                    }
                }

                if let Some(fallback) = fallback_region {
                    let fallback_set: Vec<Backend> = candidates
                        .iter()
                        .filter(|b| &b.region == fallback)
                        .cloned()
                        .collect();
                    if !fallback_set.is_empty() {
                        return fallback_set;
                    }
                }

                // Never block a query on geolocation
                candidates.to_vec()
            }

            Router::Latency { oracle } => {
                let mut best: Option<(&Backend, Duration)> = None;
                for candidate in candidates {
                    let Some(latency) = oracle.smoothed_latency(&candidate.id()) else {
                        continue;
                    };
                    let better = match best {
                        None => true,
                        Some((current, best_latency)) => {
                            latency < best_latency
                                || (latency == best_latency
                                    && candidate.addr().to_string()
                                        < current.addr().to_string())
                        }
                    };
                    if better {
                        best = Some((candidate, latency));
                    }
                }
                match best {
                    Some((backend, _)) => vec![backend.clone()],
                    // No measurements yet: fall back to every candidate
                    None => candidates.to_vec(),
                }
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}
