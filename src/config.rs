//! Runtime configuration.
//!
//! Command-line flags, the environment variables the proxy understands, and
//! the shared store for TLS material pushed down by the controller.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use parking_lot::RwLock;
use tracing::info;

use crate::error::{DnsError, DnsResult};

/// Seconds env var for the DoH per-request timeout.
pub const DOH_TIMEOUT_ENV: &str = "DNS_MESH_DOH_TIMEOUT";

/// Default DoH per-request timeout in seconds.
pub const DEFAULT_DOH_TIMEOUT_SECS: u64 = 10;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "dnsmesh")]
#[command(about = "Sidecar DNS proxy with controller-driven domain blocking", long_about = None)]
pub struct Args {
    /// Address to listen on (UDP and TCP)
    #[arg(long, default_value = "0.0.0.0:53")]
    pub listen: SocketAddr,

    /// Upstream plain-DNS server (host:port)
    #[arg(long, default_value = "1.1.1.1:53")]
    pub upstream: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Controller URL to fetch policies from
    #[arg(long)]
    pub controller: Option<String>,

    /// Policy fetch interval in seconds
    #[arg(long, default_value_t = 30)]
    pub fetch_interval: u64,

    /// Metrics HTTP server address
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics: SocketAddr,

    /// Enable DNS-over-HTTPS forwarding at startup
    #[arg(long)]
    pub https_mode: bool,

    /// DNS-over-HTTPS upstream endpoint
    #[arg(long, default_value = "https://1.1.1.1/dns-query")]
    pub https_upstream: String,

    /// Path to a CA certificate for verifying the DoH server
    #[arg(long)]
    pub tls_ca_cert: Option<PathBuf>,

    /// Path to a client certificate for mTLS
    #[arg(long)]
    pub tls_client_cert: Option<PathBuf>,

    /// Path to a client private key for mTLS
    #[arg(long)]
    pub tls_client_key: Option<PathBuf>,

    /// Skip TLS certificate verification (insecure, for testing only)
    #[arg(long)]
    pub tls_insecure_skip_verify: bool,
}

/// DoH per-request timeout from `DNS_MESH_DOH_TIMEOUT`, default 10 s.
///
/// Unparseable values fall back to the default.
#[must_use]
pub fn doh_timeout_from_env() -> Duration {
    let secs = std::env::var(DOH_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_DOH_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Decoded TLS material received from the controller.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// Client certificate, PEM.
    pub client_cert: Vec<u8>,
    /// Client private key, PEM.
    pub client_key: Vec<u8>,
    /// CA certificate, PEM.
    pub ca_cert: Vec<u8>,
}

impl TlsMaterial {
    /// Whether a client keypair is present.
    #[must_use]
    pub fn has_client_keypair(&self) -> bool {
        !self.client_cert.is_empty() && !self.client_key.is_empty()
    }
}

/// Shared store for controller-pushed TLS material.
///
/// Written on policy ticks, read when the DoH client is rebuilt. Guarded by
/// a readers-writer lock; readers copy the material out so the lock is never
/// held across client construction.
#[derive(Debug, Default)]
pub struct TlsStore {
    inner: RwLock<TlsMaterial>,
}

impl TlsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace stored material from base64-encoded PEM strings.
    ///
    /// Empty strings leave the corresponding field untouched, matching the
    /// controller contract where any of the three items may be omitted.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Tls` if any non-empty field is not valid base64;
    /// in that case no field is modified.
    pub fn update_from_base64(&self, cert: &str, key: &str, ca_cert: &str) -> DnsResult<()> {
        let decode = |label: &str, value: &str| -> DnsResult<Option<Vec<u8>>> {
            if value.is_empty() {
                return Ok(None);
            }
            BASE64
                .decode(value)
                .map(Some)
                .map_err(|e| DnsError::tls(format!("failed to decode {label} from base64: {e}")))
        };

        let cert = decode("client certificate", cert)?;
        let key = decode("client private key", key)?;
        let ca_cert = decode("CA certificate", ca_cert)?;

        let mut material = self.inner.write();
        if let Some(cert) = cert {
            material.client_cert = cert;
            info!("TLS client certificate updated from controller");
        }
        if let Some(key) = key {
            material.client_key = key;
            info!("TLS client private key updated from controller");
        }
        if let Some(ca_cert) = ca_cert {
            material.ca_cert = ca_cert;
            info!("CA certificate updated from controller");
        }
        Ok(())
    }

    /// Copy out the current material.
    #[must_use]
    pub fn material(&self) -> TlsMaterial {
        self.inner.read().clone()
    }
}
