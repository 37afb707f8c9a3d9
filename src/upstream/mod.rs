//! Upstream resolver transports.
//!
//! Three ways out: plain DNS over UDP, plain DNS over TCP (both one
//! connection per query with 5-second deadlines), and DNS-over-HTTPS through
//! a long-lived HTTP/2 client that is rebuilt whenever the TLS configuration
//! changes. The handler picks the transport per query from the current DoH
//! mode flag.

mod doh;
mod plain;

pub use doh::{DohClient, DohTlsConfig, DOH_CONTENT_TYPE};
pub use plain::{forward_tcp, forward_udp, MAX_UDP_RESPONSE, PLAIN_DNS_TIMEOUT};
