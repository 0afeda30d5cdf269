//! Probe primitives for backend health checks.
//!
//! Three probe kinds share one contract: run a single check against a
//! backend under a hard deadline of `spec.timeout` and report pass/fail
//! plus the observed latency. Probes are stateless; all hysteresis lives
//! in the manager.

use std::time::{Duration, Instant};

use reqwest::redirect;
use tokio::net::TcpStream;
use tracing::debug;

use super::HealthError;
use crate::backend::Backend;
use crate::config::{CheckScheme, CheckSpec};

/// Response bodies are drained up to this cap to free the connection, then
/// dropped.
const BODY_CAP: usize = 64 * 1024;

/// Result of a single probe attempt.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn pass(latency: Duration) -> Self {
        Self {
            ok: true,
            latency,
            error: None,
        }
    }

    fn fail(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency,
            error: Some(error.into()),
        }
    }
}

enum ProbeKind {
    Tcp,
    Http { client: reqwest::Client, url: String },
}

/// A configured probe for one backend. Constructed once per worker and
/// reused for every attempt.
pub struct Prober {
    kind: ProbeKind,
    target: std::net::SocketAddr,
    timeout: Duration,
}

impl Prober {
    pub fn new(spec: &CheckSpec, backend: &Backend) -> Result<Self, HealthError> {
        let target = backend.addr();
        let kind = match spec.scheme {
            CheckScheme::Tcp => ProbeKind::Tcp,
            CheckScheme::Http | CheckScheme::Https => {
                let host = match &backend.host {
                    Some(host) => host.clone(),
                    None => match backend.address {
                        std::net::IpAddr::V4(ip) => ip.to_string(),
                        std::net::IpAddr::V6(ip) => format!("[{ip}]"),
                    },
                };
                let url = format!(
                    "{}://{}:{}{}",
                    spec.scheme.as_str(),
                    host,
                    backend.port,
                    spec.path
                );

                let mut builder = reqwest::Client::builder()
                    .timeout(spec.timeout)
                    .connect_timeout(spec.timeout)
                    .redirect(redirect::Policy::none());
                if let Some(host) = &backend.host {
                    // Probe the configured address while presenting the
                    // operator-supplied Host/SNI name
                    builder = builder.resolve(host, target);
                }
                if spec.insecure_skip_verify {
                    builder = builder.danger_accept_invalid_certs(true);
                }
                let client = builder
                    .build()
                    .map_err(|e| HealthError::ProbeSetup(e.to_string()))?;
                ProbeKind::Http { client, url }
            }
        };

        Ok(Self {
            kind,
            target,
            timeout: spec.timeout,
        })
    }

    /// Run one probe attempt. Never takes longer than the configured
    /// timeout plus scheduling noise.
    pub async fn probe(&self) -> ProbeOutcome {
        let start = Instant::now();
        match &self.kind {
            ProbeKind::Tcp => {
                match tokio::time::timeout(self.timeout, TcpStream::connect(self.target)).await {
                    Ok(Ok(stream)) => {
                        // Handshake is the whole check; close immediately
                        drop(stream);
                        ProbeOutcome::pass(start.elapsed())
                    }
                    Ok(Err(e)) => ProbeOutcome::fail(start.elapsed(), e.to_string()),
                    Err(_) => ProbeOutcome::fail(start.elapsed(), "connect timed out"),
                }
            }
            ProbeKind::Http { client, url } => match client.get(url).send().await {
                Ok(mut response) => {
                    let status = response.status().as_u16();
                    let mut drained = 0usize;
                    while drained < BODY_CAP {
                        match response.chunk().await {
                            Ok(Some(chunk)) => drained += chunk.len(),
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                    let latency = start.elapsed();
                    if (200..400).contains(&status) {
                        ProbeOutcome::pass(latency)
                    } else {
                        debug!(url = %url, status, "Probe returned non-success status");
                        ProbeOutcome::fail(latency, format!("unexpected status {status}"))
                    }
                }
                Err(e) => ProbeOutcome::fail(start.elapsed(), e.to_string()),
            },
        }
    }
}
