//! dnsmesh: sidecar DNS policy proxy.
//!
//! Intercepts DNS queries from a co-located workload, blocks them against a
//! dynamically refreshed policy, and otherwise forwards them to an upstream
//! resolver over plain DNS (UDP/TCP) or DNS-over-HTTPS with optional mutual
//! TLS. Policy is pulled periodically from a controller and hot-swapped
//! without dropping in-flight queries.
//!
//! # Architecture
//!
//! ```text
//! Client query ──▶ Listener (UDP/TCP) ──▶ parse ──▶ matcher lookup
//!                                                        │
//!                      ┌─── blocked ◀────────────────────┤
//!                      ▼                                  ▼
//!               NXDOMAIN to client          forwarder (plain DNS / DoH)
//!                                                        │
//!                                           upstream ──▶ client
//!
//! Controller ──▶ fetcher ──▶ update channel ──▶ matcher rebuild + publish
//!                    │
//!                    └──▶ DoH mode / TLS material / dry-run / interval
//! ```
//!
//! # Modules
//!
//! - [`config`]: CLI flags, environment, shared TLS material store
//! - [`error`]: error types
//! - [`matcher`]: domain normalization and the compiled rule matcher
//! - [`metrics`]: Prometheus counters and the `/metrics` endpoint
//! - [`policy`]: controller contract, policy fetcher, hot-swap loop
//! - [`server`]: UDP/TCP listeners and the query handler
//! - [`upstream`]: plain-DNS and DoH forwarders
//! - [`wire`]: minimal DNS wire codec

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod matcher;
pub mod metrics;
pub mod policy;
pub mod server;
pub mod upstream;
pub mod wire;

pub use error::{DnsError, DnsResult};
pub use matcher::{DomainMatcher, MatcherHolder};
pub use server::{DnsHandler, HandlerConfig};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
