//! Per-backend probe worker.
//!
//! Each registered backend gets one worker task that probes at the
//! configured interval, feeds results into the shared record map, and
//! reacts to control commands (spec swap, stop) without restarting.

use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::checker::{ProbeOutcome, Prober};
use super::{BackendRecord, HealthState};
use crate::backend::{Backend, BackendId};
use crate::config::CheckSpec;
use crate::metrics;

/// Control commands delivered over the worker's watch channel.
#[derive(Debug, Clone)]
pub(super) enum Command {
    /// Keep probing with the given spec (sent on reconfiguration)
    Run(CheckSpec),
    /// Stop after the current probe, if any
    Stop,
}

pub(super) struct Worker {
    id: BackendId,
    backend: Backend,
    records: Arc<DashMap<BackendId, BackendRecord>>,
}

impl Worker {
    pub(super) fn new(backend: Backend, records: Arc<DashMap<BackendId, BackendRecord>>) -> Self {
        Self {
            id: backend.id(),
            backend,
            records,
        }
    }

    pub(super) async fn run(
        self,
        mut spec: CheckSpec,
        mut control: watch::Receiver<Command>,
    ) {
        let mut prober = self.build_prober(&spec);

        // Spread first probes across [0, interval) so a large backend set
        // does not fire in lockstep
        let jitter = {
            let mut rng = rand::rng();
            rng.random_range(0..spec.interval.as_millis().max(1) as u64)
        };
        let mut next_probe = Instant::now() + Duration::from_millis(jitter);

        debug!(backend = %self.id, jitter_ms = jitter, "Probe worker started");

        loop {
            tokio::select! {
                _ = sleep_until(next_probe) => {
                    let outcome = match &prober {
                        Some(p) => p.probe().await,
                        // Setup failures count as failed probes; the worker
                        // stays alive and keeps reporting
                        None => ProbeOutcome {
                            ok: false,
                            latency: Duration::ZERO,
                            error: Some("probe setup failed".to_string()),
                        },
                    };
                    self.apply(&spec, &outcome);
                    next_probe = Instant::now() + spec.interval;
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let command = control.borrow_and_update().clone();
                    match command {
                        Command::Stop => break,
                        Command::Run(new_spec) => {
                            prober = self.build_prober(&new_spec);
                            // Probe at the new cadence within one interval
                            let soonest = Instant::now() + new_spec.interval;
                            if soonest < next_probe {
                                next_probe = soonest;
                            }
                            spec = new_spec;
                        }
                    }
                }
            }
        }

        debug!(backend = %self.id, "Probe worker stopped");
    }

    fn build_prober(&self, spec: &CheckSpec) -> Option<Prober> {
        match Prober::new(spec, &self.backend) {
            Ok(prober) => Some(prober),
            Err(e) => {
                error!(backend = %self.id, error = %e, "Failed to build prober");
                None
            }
        }
    }

    /// Fold one probe outcome into the shared record and emit the
    /// transition event if a threshold was crossed.
    fn apply(&self, spec: &CheckSpec, outcome: &ProbeOutcome) {
        metrics::record_probe(spec.scheme.as_str(), outcome.ok, outcome.latency.as_secs_f64());

        let Some(mut record) = self.records.get_mut(&self.id) else {
            // Removed concurrently; the stop command is on its way
            return;
        };

        let transition = record.apply(outcome, chrono::Utc::now());
        let fails = record.consecutive_fails;
        drop(record);

        match transition {
            Some(HealthState::Healthy) => {
                info!(backend = %self.id, "Backend recovered - marked healthy");
                metrics::set_backend_state(&self.id, HealthState::Healthy);
                metrics::record_transition(&self.id, "healthy");
            }
            Some(HealthState::Unhealthy) => {
                warn!(
                    backend = %self.id,
                    threshold = spec.fail_threshold,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Backend marked unhealthy after consecutive failures"
                );
                metrics::set_backend_state(&self.id, HealthState::Unhealthy);
                metrics::record_transition(&self.id, "unhealthy");
            }
            Some(HealthState::Unknown) | None => {
                if !outcome.ok {
                    debug!(
                        backend = %self.id,
                        failures = fails,
                        threshold = spec.fail_threshold,
                        "Probe failed, still within threshold"
                    );
                }
            }
        }
    }
}
