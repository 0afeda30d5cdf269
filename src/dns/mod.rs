//! DNS front end: wire codec, per-query pipeline, and the UDP/TCP
//! listener.

pub mod handler;
pub mod server;
pub mod wire;

pub use handler::{QueryHandler, Transport};
pub use server::DnsServer;
