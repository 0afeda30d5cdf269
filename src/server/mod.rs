//! Process assembly: wires the registry, health manager, DNS listener,
//! and admin surface together, applies configuration snapshots, and runs
//! the shutdown sequence.
//!
//! Hot reconfiguration: SIGHUP reloads the config file, rebuilds the
//! registry, and diffs the health worker set. A snapshot that fails to
//! load or build changes nothing; the prior one keeps serving. Changes
//! under `dns:` (listen address, concurrency, stale-serve flag) need a
//! restart.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dns::{DnsServer, QueryHandler};
use crate::geo::StaticGeoMap;
use crate::health::{HealthView, Manager};
use crate::metrics::{self, AdminState};
use crate::registry::{self, Registry};
use crate::router::RouterDeps;

/// Build and install one snapshot: registry entries and health targets
/// are fully constructed before anything is swapped in, so a bad snapshot
/// installs nothing.
pub async fn apply_snapshot(
    config: &Config,
    registry: &Registry,
    manager: &Manager,
    view: &HealthView,
) -> Result<()> {
    let geo = StaticGeoMap::from_config(&config.geo)
        .map_err(|e| anyhow::anyhow!("invalid geo mapping: {e}"))?;
    let deps = RouterDeps {
        geo: Arc::new(geo),
        latency: Arc::new(view.clone()),
    };

    let entries = registry::build_entries(config, &deps).context("registry build failed")?;
    let targets = registry::backend_targets(config).context("backend expansion failed")?;

    registry.replace_all(entries);
    manager
        .reconfigure(targets)
        .await
        .context("health manager reconfiguration failed")?;

    metrics::set_domain_count(registry.count());
    Ok(())
}

pub async fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let metrics_handle = metrics::init_metrics();

    let registry = Arc::new(Registry::new());
    let manager = Arc::new(Manager::new(config.dns.shutdown_grace));
    let view = manager.view();

    apply_snapshot(&config, &registry, &manager, &view)
        .await
        .context("initial configuration rejected")?;
    manager.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // DNS listener
    let listen: SocketAddr = config
        .dns
        .listen_address
        .parse()
        .context("invalid dns.listen_address")?;
    let handler = Arc::new(QueryHandler::new(
        registry.clone(),
        Arc::new(view.clone()),
        config.dns.return_last_healthy,
    ));
    let dns_server = DnsServer::new(
        handler,
        listen,
        config.dns.query_concurrency,
        config.dns.shutdown_grace,
        shutdown_rx.clone(),
    );
    let dns_task = tokio::spawn(async move { dns_server.run().await });

    // Admin surface
    if config.admin.enabled {
        let admin_addr: SocketAddr = config
            .admin
            .listen_address
            .parse()
            .context("invalid admin.listen_address")?;
        let state = AdminState {
            handle: metrics_handle,
            health: view.clone(),
            registry: registry.clone(),
        };
        let admin_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_admin(admin_addr, state, admin_shutdown).await {
                error!(error = %e, "Admin server error");
            }
        });
    }

    // Hot reload on SIGHUP
    spawn_reload_loop(
        config_path,
        registry.clone(),
        manager.clone(),
        view,
        shutdown_rx,
    );

    info!(
        domains = registry.count(),
        servers = manager.server_count(),
        "windrose serving"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // Phase 1: listeners stop accepting and drain in-flight queries
    match tokio::time::timeout(config.dns.shutdown_grace * 2, dns_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "DNS server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "DNS server task panicked"),
        Err(_) => warn!("DNS server did not stop within grace period"),
    }

    // Phase 2: probe workers wind down
    manager.stop().await;

    info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_loop(
    config_path: PathBuf,
    registry: Arc<Registry>,
    manager: Arc<Manager>,
    view: HealthView,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    match Config::load(&config_path) {
                        Ok(config) => {
                            match apply_snapshot(&config, &registry, &manager, &view).await {
                                Ok(()) => {
                                    info!(
                                        domains = registry.count(),
                                        servers = manager.server_count(),
                                        "Configuration reloaded"
                                    );
                                    metrics::record_reload(true);
                                }
                                Err(e) => {
                                    error!(error = %e, "Reload rejected, previous snapshot stays in effect");
                                    metrics::record_reload(false);
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Reload rejected, previous snapshot stays in effect");
                            metrics::record_reload(false);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_loop(
    _config_path: PathBuf,
    _registry: Arc<Registry>,
    _manager: Arc<Manager>,
    _view: HealthView,
    _shutdown: watch::Receiver<bool>,
) {
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
