//! UDP and TCP listeners.
//!
//! Both transports bind the same address. Every incoming query is handed
//! to a task holding a semaphore permit; the permit pool bounds in-flight
//! work so slow consumers cannot exhaust memory. Shutdown stops the
//! accept loops first, then waits out in-flight queries under the grace
//! deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::handler::{QueryHandler, Transport};

/// Large enough for any EDNS-advertised query we accept.
const UDP_RECV_BUFFER: usize = 4096;

/// Idle TCP connections are closed after this long without a query.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DnsServer {
    handler: Arc<QueryHandler>,
    listen: SocketAddr,
    concurrency: usize,
    grace: Duration,
    shutdown: watch::Receiver<bool>,
}

impl DnsServer {
    pub fn new(
        handler: Arc<QueryHandler>,
        listen: SocketAddr,
        concurrency: usize,
        grace: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handler,
            listen,
            concurrency,
            grace,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            handler,
            listen,
            concurrency,
            grace,
            mut shutdown,
        } = self;

        let udp = Arc::new(
            UdpSocket::bind(listen)
                .await
                .with_context(|| format!("Failed to bind UDP {listen}"))?,
        );
        let tcp = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind TCP {listen}"))?;

        info!(addr = %listen, "DNS server listening on udp+tcp");

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut buf = vec![0u8; UDP_RECV_BUFFER];

        loop {
            tokio::select! {
                received = udp.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let permit = permits.clone().acquire_owned().await
                                .expect("query semaphore closed");
                            let handler = handler.clone();
                            let socket = udp.clone();
                            let query = buf[..len].to_vec();
                            tokio::spawn(async move {
                                if let Some(response) =
                                    handler.handle(&query, Transport::Udp, Some(peer.ip()))
                                {
                                    if let Err(e) = socket.send_to(&response, peer).await {
                                        debug!(peer = %peer, error = %e, "Failed to send UDP response");
                                    }
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => error!(error = %e, "UDP receive error"),
                    }
                }
                accepted = tcp.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            let permits = permits.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_tcp(stream, peer, handler, permits, shutdown).await
                                {
                                    debug!(peer = %peer, error = %e, "TCP connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "TCP accept error"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("DNS listeners stopped accepting, draining in-flight queries");
        let drained =
            tokio::time::timeout(grace, permits.acquire_many(concurrency as u32)).await;
        if drained.is_err() {
            warn!("In-flight queries did not drain within grace period");
        }

        Ok(())
    }
}

/// Serve length-prefixed queries on one TCP connection until the peer
/// closes, the connection idles out, or shutdown is signaled.
async fn serve_tcp(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<QueryHandler>,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let mut length = [0u8; 2];

        tokio::select! {
            read = tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut length)) => {
                match read {
                    Err(_) => {
                        debug!(peer = %peer, "Closing idle TCP connection");
                        return Ok(());
                    }
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(_)) => {}
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        }

        let len = u16::from_be_bytes(length) as usize;
        if len == 0 {
            return Ok(());
        }
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .expect("query semaphore closed");
        let response = handler.handle(&query, Transport::Tcp, Some(peer.ip()));
        drop(permit);

        if let Some(response) = response {
            stream
                .write_all(&(response.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::backend::{Backend, BackendId};
    use crate::config::RoutingAlgorithm;
    use crate::dns::wire::{self, Message, Rcode, RecordType};
    use crate::geo::NoGeo;
    use crate::health::{HealthProvider, HealthSnapshot, HealthState};
    use crate::registry::{canonicalize, DomainEntry, Registry};
    use crate::router::{NoLatency, Router, RouterDeps};

    struct AllHealthy;

    impl HealthProvider for AllHealthy {
        fn status(&self, _id: &BackendId) -> Option<HealthSnapshot> {
            Some(HealthSnapshot {
                state: HealthState::Healthy,
                last_check: Some(chrono::Utc::now()),
                last_healthy: Some(chrono::Utc::now()),
            })
        }

        fn all_status(&self) -> HashMap<BackendId, HealthSnapshot> {
            HashMap::new()
        }
    }

    async fn spawn_server() -> (SocketAddr, watch::Sender<bool>) {
        let registry = Arc::new(Registry::new());
        let deps = RouterDeps {
            geo: Arc::new(NoGeo),
            latency: Arc::new(NoLatency),
        };
        registry.replace_all(vec![DomainEntry {
            fqdn: canonicalize("app.example.com"),
            ttl: 30,
            servers: vec![Backend {
                address: "10.0.1.10".parse().unwrap(),
                port: 80,
                weight: 100,
                region: "us-east-1".into(),
                host: None,
            }],
            router: Router::new(RoutingAlgorithm::Failover, &deps, None),
        }]);

        let handler = Arc::new(QueryHandler::new(registry, Arc::new(AllHealthy), false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Grab a free port by binding then rebinding in the server
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let server = DnsServer::new(handler, addr, 16, Duration::from_secs(1), shutdown_rx);
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (addr, shutdown_tx)
    }

    #[tokio::test]
    async fn test_udp_query_round_trip() {
        let (addr, _shutdown) = spawn_server().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = wire::query(99, "app.example.com", RecordType::A)
            .encode(512)
            .unwrap();
        client.send_to(&query, addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let response = Message::decode(&buf[..len]).unwrap();
        assert_eq!(response.header.id, 99);
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_query_round_trip() {
        let (addr, _shutdown) = spawn_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let query = wire::query(7, "app.example.com", RecordType::A)
            .encode(512)
            .unwrap();
        stream
            .write_all(&(query.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&query).await.unwrap();

        let mut length = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut length))
            .await
            .unwrap()
            .unwrap();
        let mut response = vec![0u8; u16::from_be_bytes(length) as usize];
        stream.read_exact(&mut response).await.unwrap();

        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.header.id, 7);
        assert_eq!(decoded.answers.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let (addr, shutdown) = spawn_server().await;
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The port should be released once the server has wound down
        let rebind = UdpSocket::bind(addr).await;
        assert!(rebind.is_ok());
    }
}
