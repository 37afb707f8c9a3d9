//! DNS listeners and the shared query handler.
//!
//! Both listeners bind the same address. Every accepted UDP datagram and
//! every accepted TCP connection runs in its own task; per-query failures
//! are isolated and never stop the accept loops.

mod handler;
mod tcp;
mod udp;

pub use handler::{DnsHandler, HandlerConfig, CLIENT_READ_TIMEOUT};
pub use tcp::TcpDnsServer;
pub use udp::{UdpDnsServer, MAX_UDP_PACKET};
