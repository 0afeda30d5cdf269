//! Prometheus metrics and the admin listener.
//!
//! This module provides:
//! - Metric registration and small helpers the subsystems record against
//! - An admin router exposing `/metrics`, `/healthz`, and `/status`
//!
//! Subsystems never talk to a metrics registry directly; they call the
//! helpers here against the installed recorder.

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::backend::BackendId;
use crate::health::{BackendOverview, HealthState, HealthView};
use crate::registry::Registry;

// Metric names as constants for consistency
pub const PROBES_TOTAL: &str = "windrose_probes_total";
pub const PROBE_DURATION_SECONDS: &str = "windrose_probe_duration_seconds";
pub const BACKEND_STATE: &str = "windrose_backend_state";
pub const TRANSITIONS_TOTAL: &str = "windrose_health_transitions_total";
pub const SERVERS_REGISTERED: &str = "windrose_servers_registered";
pub const DOMAINS_REGISTERED: &str = "windrose_domains_registered";
pub const QUERIES_TOTAL: &str = "windrose_queries_total";
pub const QUERY_DURATION_SECONDS: &str = "windrose_query_duration_seconds";
pub const STALE_SERVES_TOTAL: &str = "windrose_stale_serves_total";
pub const RELOADS_TOTAL: &str = "windrose_reloads_total";

/// Install the Prometheus recorder and register metric descriptions.
/// Called once during startup.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    describe_counter!(PROBES_TOTAL, "Health probes issued, by scheme and result");
    describe_histogram!(PROBE_DURATION_SECONDS, "Health probe duration in seconds");
    describe_gauge!(
        BACKEND_STATE,
        "Backend health state (1 healthy, 0 unhealthy, -1 unknown)"
    );
    describe_counter!(
        TRANSITIONS_TOTAL,
        "Health state transitions, by backend and new state"
    );
    describe_gauge!(SERVERS_REGISTERED, "Backends registered with the health manager");
    describe_gauge!(DOMAINS_REGISTERED, "Domains in the registry");
    describe_counter!(QUERIES_TOTAL, "DNS queries answered, by rcode");
    describe_histogram!(QUERY_DURATION_SECONDS, "Query handling duration in seconds");
    describe_counter!(
        STALE_SERVES_TOTAL,
        "Answers served from the last known healthy set"
    );
    describe_counter!(RELOADS_TOTAL, "Configuration reload attempts, by result");

    handle
}

pub fn record_probe(scheme: &str, ok: bool, duration_secs: f64) {
    let result = if ok { "pass" } else { "fail" };
    counter!(PROBES_TOTAL, "scheme" => scheme.to_string(), "result" => result).increment(1);
    histogram!(PROBE_DURATION_SECONDS, "scheme" => scheme.to_string()).record(duration_secs);
}

pub fn set_backend_state(id: &BackendId, state: HealthState) {
    let value = match state {
        HealthState::Healthy => 1.0,
        HealthState::Unhealthy => 0.0,
        HealthState::Unknown => -1.0,
    };
    gauge!(BACKEND_STATE, "backend" => id.to_string()).set(value);
}

pub fn record_transition(id: &BackendId, to: &'static str) {
    counter!(TRANSITIONS_TOTAL, "backend" => id.to_string(), "to" => to).increment(1);
}

pub fn set_server_count(count: usize) {
    gauge!(SERVERS_REGISTERED).set(count as f64);
}

pub fn set_domain_count(count: usize) {
    gauge!(DOMAINS_REGISTERED).set(count as f64);
}

pub fn record_query(rcode: &'static str, duration_secs: f64) {
    counter!(QUERIES_TOTAL, "rcode" => rcode).increment(1);
    histogram!(QUERY_DURATION_SECONDS).record(duration_secs);
}

pub fn record_stale_serve(fqdn: &str) {
    counter!(STALE_SERVES_TOTAL, "domain" => fqdn.to_string()).increment(1);
}

pub fn record_reload(ok: bool) {
    let result = if ok { "ok" } else { "rejected" };
    counter!(RELOADS_TOTAL, "result" => result).increment(1);
}

/// Shared state behind the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub handle: PrometheusHandle,
    pub health: HealthView,
    pub registry: Arc<Registry>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    domains: Vec<String>,
    servers: Vec<BackendOverview>,
}

pub fn admin_router(state: AdminState) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(render_status))
        .with_state(state)
}

async fn render_metrics(State(state): State<AdminState>) -> String {
    state.handle.render()
}

async fn render_status(State(state): State<AdminState>) -> Json<StatusResponse> {
    let mut domains = state.registry.domains();
    domains.sort();

    Json(StatusResponse {
        domains,
        servers: state.health.overview(),
    })
}

/// Run the admin listener until shutdown is signaled.
pub async fn serve_admin(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Admin server listening");

    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response_shape() {
        let response = StatusResponse {
            domains: vec!["app.example.com.".into()],
            servers: vec![BackendOverview {
                backend: "10.0.1.10:80".into(),
                region: "us-east-1".into(),
                scheme: "http",
                state: HealthState::Healthy,
                consecutive_fails: 0,
                consecutive_passes: 4,
                last_check: None,
                last_healthy: None,
                last_error: None,
                transitions: 1,
                probe_latency_ms: Some(12),
            }],
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["domains"][0], "app.example.com.");
        assert_eq!(value["servers"][0]["backend"], "10.0.1.10:80");
        assert_eq!(value["servers"][0]["state"], "healthy");
        assert_eq!(value["servers"][0]["probe_latency_ms"], 12);
    }
}
