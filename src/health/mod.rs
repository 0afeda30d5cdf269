//! Backend health tracking.
//!
//! The manager owns one probe worker per registered backend. Workers feed
//! raw probe results into a shared record map where hysteresis thresholds
//! decide the authoritative state. Everything outside this module sees
//! only read-side snapshots through the [`HealthProvider`] capability;
//! snapshot reads never block on probe I/O.

pub mod checker;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use checker::{ProbeOutcome, Prober};

use crate::backend::{Backend, BackendId};
use crate::config::CheckSpec;
use crate::metrics;
use crate::router::LatencyOracle;
use worker::{Command, Worker};

const EWMA_ALPHA: f64 = 0.3;

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("backend already registered: {0}")]
    DuplicateServer(BackendId),

    #[error("backend not registered: {0}")]
    UnknownServer(BackendId),

    #[error("failed to set up probe: {0}")]
    ProbeSetup(String),
}

/// Authoritative health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Neither threshold satisfied yet (initial condition). Answered as
    /// healthy by the DNS handler so a new backend is not withheld before
    /// its first probe window completes.
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Read-only view of one backend's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    /// When this backend was last observed healthy; `Some` means it has
    /// been healthy at least once (used by stale-serve)
    pub last_healthy: Option<DateTime<Utc>>,
}

/// Per-backend record: probe spec, hysteresis counters, and the derived
/// state. Owned by the manager; workers update it through the shared map.
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub backend: Backend,
    pub spec: CheckSpec,
    pub state: HealthState,
    pub consecutive_fails: u32,
    pub consecutive_passes: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
    pub transitions: u64,
    pub latency_ewma: Option<Duration>,
}

impl BackendRecord {
    fn new(backend: Backend, spec: CheckSpec) -> Self {
        Self {
            backend,
            spec,
            state: HealthState::Unknown,
            consecutive_fails: 0,
            consecutive_passes: 0,
            last_check: None,
            last_error: None,
            last_healthy: None,
            last_transition: None,
            transitions: 0,
            latency_ewma: None,
        }
    }

    /// Fold one probe result into the state machine. Returns the new state
    /// when a threshold gate was crossed, `None` otherwise.
    ///
    /// The trajectory is a deterministic function of the result sequence,
    /// the thresholds, and the initial state.
    pub fn apply(&mut self, outcome: &ProbeOutcome, now: DateTime<Utc>) -> Option<HealthState> {
        self.last_check = Some(now);

        if outcome.ok {
            self.consecutive_fails = 0;
            self.consecutive_passes += 1;
            self.last_error = None;
            self.latency_ewma = Some(match self.latency_ewma {
                Some(prev) => {
                    prev.mul_f64(1.0 - EWMA_ALPHA) + outcome.latency.mul_f64(EWMA_ALPHA)
                }
                None => outcome.latency,
            });

            if self.state != HealthState::Healthy
                && self.consecutive_passes >= self.spec.pass_threshold
            {
                self.state = HealthState::Healthy;
                self.last_healthy = Some(now);
                self.last_transition = Some(now);
                self.transitions += 1;
                return Some(HealthState::Healthy);
            }
            if self.state == HealthState::Healthy {
                self.last_healthy = Some(now);
            }
            None
        } else {
            self.consecutive_passes = 0;
            self.consecutive_fails += 1;
            self.last_error = outcome.error.clone();

            if self.state != HealthState::Unhealthy
                && self.consecutive_fails >= self.spec.fail_threshold
            {
                self.state = HealthState::Unhealthy;
                self.last_transition = Some(now);
                self.transitions += 1;
                return Some(HealthState::Unhealthy);
            }
            None
        }
    }

    /// Reset hysteresis after a scheme change: the probe semantics differ,
    /// so accumulated evidence no longer applies.
    fn reset(&mut self) {
        self.state = HealthState::Unknown;
        self.consecutive_fails = 0;
        self.consecutive_passes = 0;
        self.latency_ewma = None;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state,
            last_check: self.last_check,
            last_healthy: self.last_healthy,
        }
    }
}

/// Capability the DNS handler uses to filter candidates. Long-lived; the
/// manager swaps state behind it during reconfiguration.
pub trait HealthProvider: Send + Sync {
    fn status(&self, id: &BackendId) -> Option<HealthSnapshot>;
    fn all_status(&self) -> HashMap<BackendId, HealthSnapshot>;
}

/// Cloneable read handle over the manager's record map. Also serves as the
/// default latency oracle, backed by the probe latency EWMA.
#[derive(Clone)]
pub struct HealthView {
    records: Arc<DashMap<BackendId, BackendRecord>>,
}

impl HealthProvider for HealthView {
    fn status(&self, id: &BackendId) -> Option<HealthSnapshot> {
        self.records.get(id).map(|r| r.snapshot())
    }

    fn all_status(&self) -> HashMap<BackendId, HealthSnapshot> {
        self.records
            .iter()
            .map(|r| (*r.key(), r.snapshot()))
            .collect()
    }
}

impl LatencyOracle for HealthView {
    fn smoothed_latency(&self, id: &BackendId) -> Option<Duration> {
        self.records.get(id).and_then(|r| r.latency_ewma)
    }
}

/// Operator-facing detail row for the admin surface. Richer than a
/// [`HealthSnapshot`]; the query path never sees this.
#[derive(Debug, Clone, Serialize)]
pub struct BackendOverview {
    pub backend: String,
    pub region: String,
    pub scheme: &'static str,
    pub state: HealthState,
    pub consecutive_fails: u32,
    pub consecutive_passes: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub transitions: u64,
    pub probe_latency_ms: Option<u64>,
}

impl HealthView {
    pub fn overview(&self) -> Vec<BackendOverview> {
        let mut rows: Vec<BackendOverview> = self
            .records
            .iter()
            .map(|r| BackendOverview {
                backend: r.key().to_string(),
                region: r.backend.region.clone(),
                scheme: r.spec.scheme.as_str(),
                state: r.state,
                consecutive_fails: r.consecutive_fails,
                consecutive_passes: r.consecutive_passes,
                last_check: r.last_check,
                last_healthy: r.last_healthy,
                last_error: r.last_error.clone(),
                transitions: r.transitions,
                probe_latency_ms: r.latency_ewma.map(|d| d.as_millis() as u64),
            })
            .collect();
        rows.sort_by(|a, b| a.backend.cmp(&b.backend));
        rows
    }
}

/// Counts returned by [`Manager::reconfigure`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconfigureSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

struct WorkerHandle {
    control: watch::Sender<Command>,
    task: JoinHandle<()>,
}

/// Owns the probe workers and the record map.
pub struct Manager {
    records: Arc<DashMap<BackendId, BackendRecord>>,
    // Structural lock for worker spawn/teardown; snapshot readers never
    // take it
    workers: Mutex<HashMap<BackendId, WorkerHandle>>,
    started: AtomicBool,
    grace: Duration,
}

impl Manager {
    pub fn new(grace: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            workers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            grace,
        }
    }

    /// Read handle for the DNS handler and the admin surface.
    pub fn view(&self) -> HealthView {
        HealthView {
            records: self.records.clone(),
        }
    }

    pub fn server_count(&self) -> usize {
        self.records.len()
    }

    pub fn status(&self, id: &BackendId) -> Option<HealthSnapshot> {
        self.records.get(id).map(|r| r.snapshot())
    }

    pub fn all_status(&self) -> HashMap<BackendId, HealthSnapshot> {
        self.records
            .iter()
            .map(|r| (*r.key(), r.snapshot()))
            .collect()
    }

    /// Register a backend and, if the manager is running, start probing it.
    /// The first probe fires after a jitter of `[0, interval)`.
    pub fn add_server(&self, backend: Backend, spec: CheckSpec) -> Result<(), HealthError> {
        let id = backend.id();
        if self.records.contains_key(&id) {
            return Err(HealthError::DuplicateServer(id));
        }

        self.records
            .insert(id, BackendRecord::new(backend.clone(), spec.clone()));

        if self.started.load(Ordering::SeqCst) {
            let mut workers = self.workers.lock();
            workers.insert(id, self.spawn_worker(backend, spec));
        }

        metrics::set_server_count(self.records.len());
        debug!(backend = %id, "Registered backend");
        Ok(())
    }

    /// Signal the backend's worker to stop and wait for it up to the grace
    /// period, then drop its record.
    pub async fn remove_server(&self, id: &BackendId) -> Result<(), HealthError> {
        if self.records.remove(id).is_none() {
            return Err(HealthError::UnknownServer(*id));
        }

        let handle = self.workers.lock().remove(id);
        if let Some(handle) = handle {
            let _ = handle.control.send(Command::Stop);
            if tokio::time::timeout(self.grace, handle.task)
                .await
                .is_err()
            {
                warn!(backend = %id, "Probe worker did not stop within grace period");
            }
        }

        metrics::set_server_count(self.records.len());
        debug!(backend = %id, "Removed backend");
        Ok(())
    }

    /// Diff the current backend set against `targets` by `(address, port)`.
    ///
    /// Unchanged backends keep their worker, their state, and their
    /// counters. A cadence change swaps the spec in place, still preserving
    /// state; a scheme change resets the record to `Unknown` because the
    /// probe semantics differ. Additions and removals behave like
    /// [`Manager::add_server`] / [`Manager::remove_server`].
    pub async fn reconfigure(
        &self,
        targets: Vec<(Backend, CheckSpec)>,
    ) -> Result<ReconfigureSummary, HealthError> {
        let mut summary = ReconfigureSummary::default();

        let mut desired: HashMap<BackendId, (Backend, CheckSpec)> = HashMap::new();
        for (backend, spec) in targets {
            desired.insert(backend.id(), (backend, spec));
        }

        let existing: Vec<BackendId> = self.records.iter().map(|r| *r.key()).collect();

        for id in &existing {
            match desired.remove(id) {
                None => {
                    self.remove_server(id).await?;
                    summary.removed += 1;
                }
                Some((backend, spec)) => {
                    let mut record = match self.records.get_mut(id) {
                        Some(r) => r,
                        None => continue,
                    };
                    let spec_changed = record.spec != spec;
                    let scheme_changed = record.spec.scheme != spec.scheme;

                    // Weight/region edits do not disturb health state
                    record.backend = backend;
                    if spec_changed {
                        record.spec = spec.clone();
                        if scheme_changed {
                            record.reset();
                        }
                        drop(record);

                        let workers = self.workers.lock();
                        if let Some(handle) = workers.get(id) {
                            let _ = handle.control.send(Command::Run(spec));
                        }
                        summary.updated += 1;
                    }
                }
            }
        }

        for (_, (backend, spec)) in desired {
            self.add_server(backend, spec)?;
            summary.added += 1;
        }

        info!(
            added = summary.added,
            removed = summary.removed,
            updated = summary.updated,
            servers = self.records.len(),
            "Health manager reconfigured"
        );
        Ok(summary)
    }

    /// Spawn workers for every registered backend. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock();
        for record in self.records.iter() {
            let backend = record.backend.clone();
            let spec = record.spec.clone();
            workers
                .entry(*record.key())
                .or_insert_with(|| self.spawn_worker(backend, spec));
        }

        info!(servers = workers.len(), "Health manager started");
    }

    /// Stop all workers, waiting up to the grace period before aborting
    /// stragglers. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            workers.drain().map(|(_, h)| h).collect()
        };

        for handle in &handles {
            let _ = handle.control.send(Command::Stop);
        }

        let tasks: Vec<JoinHandle<()>> = handles.into_iter().map(|h| h.task).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(self.grace, join_all(tasks)).await.is_err() {
            warn!("Some probe workers did not stop within grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        info!("Health manager stopped");
    }

    fn spawn_worker(&self, backend: Backend, spec: CheckSpec) -> WorkerHandle {
        let (control, rx) = watch::channel(Command::Run(spec.clone()));
        let worker = Worker::new(backend, self.records.clone());
        let task = tokio::spawn(worker.run(spec, rx));
        WorkerHandle { control, task }
    }
}
