//! Backend endpoint types shared by the health manager, routers, and the
//! domain registry.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// One `(address, port)` endpoint that may be returned in a DNS answer.
///
/// Immutable once constructed for a configuration generation; a
/// reconfiguration builds fresh values rather than mutating these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u16,
    pub region: String,
    /// Host header / SNI override for HTTP(S) probes
    pub host: Option<String>,
}

impl Backend {
    pub fn id(&self) -> BackendId {
        BackendId(SocketAddr::new(self.address, self.port))
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }
}

/// Backend identity: `(address, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BackendId(pub SocketAddr);

impl BackendId {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(address, port))
    }

    pub fn address(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_id_identity() {
        let a = Backend {
            address: "10.0.1.10".parse().unwrap(),
            port: 80,
            weight: 100,
            region: "us-east-1".into(),
            host: None,
        };
        let b = Backend {
            weight: 500,
            region: "eu-west-1".into(),
            ..a.clone()
        };
        // Identity is (address, port) regardless of weight or region
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().to_string(), "10.0.1.10:80");
    }
}
