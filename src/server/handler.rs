//! Query processing: the hot path.
//!
//! One [`DnsHandler`] is shared by both listeners. Per query it parses the
//! question, consults a single matcher snapshot, and either synthesizes an
//! NXDOMAIN (blocked) or forwards through the transport selected by the
//! current DoH mode flag. Blocking and forwarding are mutually exclusive and
//! both terminal.
//!
//! Mutable state and its discipline:
//!
//! - the active matcher is read lock-free through [`MatcherHolder`], once
//!   per query,
//! - the dry-run flag is an atomic shared with the policy fetcher,
//! - DoH mode and the DoH client handle live behind a readers-writer lock;
//!   queries take a brief read, policy updates take the write for the
//!   duration of a client rebuild, so a query sees the old client or the new
//!   one but never a torn state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{TlsMaterial, TlsStore};
use crate::error::{DnsError, DnsResult};
use crate::matcher::{DomainMatcher, MatcherHolder};
use crate::metrics::{
    ERRORS_TOTAL, ERROR_TYPE_CLIENT_WRITE, ERROR_TYPE_PARSE, QUERIES_ALLOWED, QUERIES_BLOCKED,
    QUERIES_TOTAL, QUERY_DURATION,
};
use crate::upstream::{forward_tcp, forward_udp, DohClient, DohTlsConfig};
use crate::wire;

/// Read deadline applied to client TCP connections.
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler construction parameters.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Plain-DNS upstream (`host:port`).
    pub upstream: String,
    /// Whether DoH forwarding is enabled at startup.
    pub doh_enabled: bool,
    /// DoH endpoint URL.
    pub doh_upstream: String,
    /// DoH per-request timeout.
    pub doh_timeout: Duration,
    /// File-based TLS settings from the command line.
    pub tls: DohTlsConfig,
}

/// DoH mode and client, swapped whole under the handler lock.
struct DohState {
    enabled: bool,
    client: Option<Arc<DohClient>>,
}

/// Shared query handler.
pub struct DnsHandler {
    upstream: String,
    doh_upstream: String,
    doh_timeout: Duration,
    tls_files: DohTlsConfig,
    tls_store: Arc<TlsStore>,
    matcher: MatcherHolder,
    dry_run: Arc<AtomicBool>,
    doh: RwLock<DohState>,
}

impl DnsHandler {
    /// Create a handler. If DoH mode is enabled at startup the client is
    /// built immediately; a TLS material failure falls back to default TLS
    /// inside the client constructor.
    #[must_use]
    pub fn new(config: HandlerConfig, tls_store: Arc<TlsStore>) -> Self {
        let handler = Self {
            upstream: config.upstream,
            doh_upstream: config.doh_upstream,
            doh_timeout: config.doh_timeout,
            tls_files: config.tls,
            tls_store,
            matcher: MatcherHolder::default(),
            dry_run: Arc::new(AtomicBool::new(false)),
            doh: RwLock::new(DohState {
                enabled: false,
                client: None,
            }),
        };

        if config.doh_enabled {
            handler.set_doh_mode(true);
        }

        handler
    }

    /// The plain-DNS upstream address.
    #[must_use]
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Publish a new matcher snapshot.
    pub fn update_matcher(&self, matcher: DomainMatcher) {
        info!(rules = matcher.rule_count(), "matcher updated");
        self.matcher.publish(matcher);
    }

    /// Current matcher snapshot.
    #[must_use]
    pub fn matcher(&self) -> Arc<DomainMatcher> {
        self.matcher.current()
    }

    /// The dry-run flag, shared with the policy fetcher.
    #[must_use]
    pub fn dry_run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dry_run)
    }

    /// Whether dry-run mode is active.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    /// Whether DoH forwarding is currently active.
    #[must_use]
    pub fn is_doh_enabled(&self) -> bool {
        self.doh.read().enabled
    }

    /// Enable or disable DoH forwarding.
    ///
    /// Enabling builds a client from the current TLS material if none is
    /// allocated yet. Disabling only clears the mode flag; the client object
    /// stays allocated for a later re-enable.
    pub fn set_doh_mode(&self, enabled: bool) {
        let mut state = self.doh.write();
        if enabled {
            if state.client.is_none() {
                state.client = self.build_doh_client();
            }
            if !state.enabled {
                info!(upstream = %self.doh_upstream, "DNS-over-HTTPS mode enabled");
            }
            state.enabled = true;
        } else {
            if state.enabled {
                info!("DNS-over-HTTPS mode disabled");
            }
            state.enabled = false;
        }
    }

    /// Rebuild the DoH client after a TLS material update.
    ///
    /// No-op while DoH mode is disabled. Holds the writer lock for the
    /// duration of the rebuild so queries never observe a partially
    /// constructed client.
    pub fn refresh_doh_client(&self) {
        let mut state = self.doh.write();
        if !state.enabled {
            return;
        }
        info!("rebuilding DoH client with updated TLS configuration");
        if let Some(client) = self.build_doh_client() {
            state.client = Some(client);
        }
    }

    /// Merge CLI file paths with controller-pushed in-memory material.
    fn effective_tls_config(&self) -> DohTlsConfig {
        let mut tls = self.tls_files.clone();
        let material: TlsMaterial = self.tls_store.material();
        if material.has_client_keypair() {
            tls.client_cert_pem = Some(material.client_cert);
            tls.client_key_pem = Some(material.client_key);
        }
        if !material.ca_cert.is_empty() {
            tls.ca_cert_pem = Some(material.ca_cert);
        }
        tls
    }

    fn build_doh_client(&self) -> Option<Arc<DohClient>> {
        match DohClient::new(&self.doh_upstream, self.doh_timeout, &self.effective_tls_config()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!(error = %e, upstream = %self.doh_upstream, "failed to build DoH client");
                None
            }
        }
    }

    /// The client to forward through, if DoH mode is on.
    ///
    /// `Ok(None)` means plain-DNS forwarding; an error means DoH is enabled
    /// but no client could be built.
    fn doh_client_snapshot(&self) -> DnsResult<Option<Arc<DohClient>>> {
        let state = self.doh.read();
        if !state.enabled {
            return Ok(None);
        }
        state
            .client
            .clone()
            .map(Some)
            .ok_or_else(|| DnsError::internal("DoH client not initialized"))
    }

    /// Forward a query through the transport selected by the DoH flag.
    ///
    /// Returns the response bytes and the protocol label used for metrics.
    async fn forward(&self, query: &[u8], tcp: bool) -> Result<(Vec<u8>, &'static str), (DnsError, &'static str)> {
        match self.doh_client_snapshot() {
            Ok(Some(client)) => match client.query(query).await {
                Ok(response) => Ok((response, "https")),
                Err(e) => Err((e, "https")),
            },
            Ok(None) => {
                let label = if tcp { "tcp" } else { "udp" };
                let result = if tcp {
                    forward_tcp(&self.upstream, query).await
                } else {
                    forward_udp(&self.upstream, query).await
                };
                result.map(|r| (r, label)).map_err(|e| (e, label))
            }
            Err(e) => Err((e, "https")),
        }
    }

    // ========================================================================
    // UDP path
    // ========================================================================

    /// Process one UDP datagram and answer via the shared listening socket.
    pub async fn handle_udp_query(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        query: Vec<u8>,
    ) {
        let start = Instant::now();
        QUERIES_TOTAL.with_label_values(&["udp"]).inc();

        let Some((domain, qtype)) = wire::parse_query(&query) else {
            if query.len() >= wire::HEADER_LEN {
                ERRORS_TOTAL
                    .with_label_values(&[ERROR_TYPE_PARSE, "udp"])
                    .inc();
                QUERY_DURATION
                    .with_label_values(&["udp", "error"])
                    .observe(start.elapsed().as_secs_f64());
            }
            return;
        };

        debug!(peer = %peer, domain = %domain, qtype = %qtype, "UDP query");

        let matcher = self.matcher.current();
        if let Some(hit) = matcher.evaluate(&domain) {
            if self.is_dry_run() {
                info!(domain = %domain, rule = %hit.rule, "dry-run: would block");
            } else {
                info!(domain = %domain, rule = %hit.rule, "blocking, returning NXDOMAIN");
                QUERIES_BLOCKED.with_label_values(&["udp"]).inc();

                match wire::nxdomain_response(&query) {
                    Some(response) => {
                        if let Err(e) = socket.send_to(&response, peer).await {
                            error!(peer = %peer, error = %e, "failed to send NXDOMAIN to client");
                            ERRORS_TOTAL
                                .with_label_values(&[ERROR_TYPE_CLIENT_WRITE, "udp"])
                                .inc();
                        }
                    }
                    None => {
                        ERRORS_TOTAL
                            .with_label_values(&[ERROR_TYPE_PARSE, "udp"])
                            .inc();
                    }
                }

                QUERY_DURATION
                    .with_label_values(&["udp", "blocked"])
                    .observe(start.elapsed().as_secs_f64());
                return;
            }
        }

        let (response, protocol) = match self.forward(&query, false).await {
            Ok(result) => result,
            Err((e, protocol)) => {
                warn!(domain = %domain, error = %e, "upstream forward failed");
                ERRORS_TOTAL
                    .with_label_values(&[e.metric_label(), protocol])
                    .inc();
                QUERY_DURATION
                    .with_label_values(&[protocol, "error"])
                    .observe(start.elapsed().as_secs_f64());
                return;
            }
        };

        if let Err(e) = socket.send_to(&response, peer).await {
            error!(peer = %peer, error = %e, "failed to send response to client");
            ERRORS_TOTAL
                .with_label_values(&[ERROR_TYPE_CLIENT_WRITE, protocol])
                .inc();
            QUERY_DURATION
                .with_label_values(&[protocol, "error"])
                .observe(start.elapsed().as_secs_f64());
            return;
        }

        QUERIES_ALLOWED.with_label_values(&[protocol]).inc();
        QUERY_DURATION
            .with_label_values(&[protocol, "allowed"])
            .observe(start.elapsed().as_secs_f64());
    }

    // ========================================================================
    // TCP path
    // ========================================================================

    /// Process one TCP connection: one length-prefixed query, one
    /// length-prefixed response. The connection is closed on every exit
    /// path (by drop).
    pub async fn handle_tcp_conn(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let start = Instant::now();
        QUERIES_TOTAL.with_label_values(&["tcp"]).inc();

        let query = match read_framed_query(&mut stream).await {
            Ok(query) => query,
            Err(e) => {
                debug!(peer = %peer, error = %e, "failed to read TCP query");
                ERRORS_TOTAL
                    .with_label_values(&[ERROR_TYPE_PARSE, "tcp"])
                    .inc();
                QUERY_DURATION
                    .with_label_values(&["tcp", "error"])
                    .observe(start.elapsed().as_secs_f64());
                return;
            }
        };

        let Some((domain, qtype)) = wire::parse_query(&query) else {
            if query.len() >= wire::HEADER_LEN {
                ERRORS_TOTAL
                    .with_label_values(&[ERROR_TYPE_PARSE, "tcp"])
                    .inc();
                QUERY_DURATION
                    .with_label_values(&["tcp", "error"])
                    .observe(start.elapsed().as_secs_f64());
            }
            return;
        };

        debug!(peer = %peer, domain = %domain, qtype = %qtype, "TCP query");

        let matcher = self.matcher.current();
        if let Some(hit) = matcher.evaluate(&domain) {
            if self.is_dry_run() {
                info!(domain = %domain, rule = %hit.rule, "dry-run: would block");
            } else {
                info!(domain = %domain, rule = %hit.rule, "blocking, returning NXDOMAIN");
                QUERIES_BLOCKED.with_label_values(&["tcp"]).inc();

                match wire::nxdomain_response(&query) {
                    Some(response) => {
                        if let Err(e) = write_framed(&mut stream, &response).await {
                            error!(peer = %peer, error = %e, "failed to send NXDOMAIN to client");
                            ERRORS_TOTAL
                                .with_label_values(&[ERROR_TYPE_CLIENT_WRITE, "tcp"])
                                .inc();
                        }
                    }
                    None => {
                        ERRORS_TOTAL
                            .with_label_values(&[ERROR_TYPE_PARSE, "tcp"])
                            .inc();
                    }
                }

                QUERY_DURATION
                    .with_label_values(&["tcp", "blocked"])
                    .observe(start.elapsed().as_secs_f64());
                return;
            }
        }

        let (response, protocol) = match self.forward(&query, true).await {
            Ok(result) => result,
            Err((e, protocol)) => {
                warn!(domain = %domain, error = %e, "upstream forward failed");
                ERRORS_TOTAL
                    .with_label_values(&[e.metric_label(), protocol])
                    .inc();
                QUERY_DURATION
                    .with_label_values(&[protocol, "error"])
                    .observe(start.elapsed().as_secs_f64());
                return;
            }
        };

        if let Err(e) = write_framed(&mut stream, &response).await {
            error!(peer = %peer, error = %e, "failed to send response to client");
            ERRORS_TOTAL
                .with_label_values(&[ERROR_TYPE_CLIENT_WRITE, protocol])
                .inc();
            QUERY_DURATION
                .with_label_values(&[protocol, "error"])
                .observe(start.elapsed().as_secs_f64());
            return;
        }

        QUERIES_ALLOWED.with_label_values(&[protocol]).inc();
        QUERY_DURATION
            .with_label_values(&[protocol, "allowed"])
            .observe(start.elapsed().as_secs_f64());
    }
}

impl std::fmt::Debug for DnsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsHandler")
            .field("upstream", &self.upstream)
            .field("doh_upstream", &self.doh_upstream)
            .field("doh_enabled", &self.is_doh_enabled())
            .field("dry_run", &self.is_dry_run())
            .field("rules", &self.matcher.current().rule_count())
            .finish()
    }
}

/// Read one length-prefixed DNS message under the client read deadline.
async fn read_framed_query(stream: &mut TcpStream) -> DnsResult<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    timeout(CLIENT_READ_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| DnsError::timeout("client length prefix", CLIENT_READ_TIMEOUT))?
        .map_err(|e| DnsError::parse(format!("failed to read length prefix: {e}")))?;

    let query_len = usize::from(u16::from_be_bytes(len_buf));
    if query_len == 0 {
        return Err(DnsError::parse("zero-length query"));
    }

    let mut query = vec![0u8; query_len];
    timeout(CLIENT_READ_TIMEOUT, stream.read_exact(&mut query))
        .await
        .map_err(|_| DnsError::timeout("client query body", CLIENT_READ_TIMEOUT))?
        .map_err(|e| DnsError::parse(format!("failed to read query body: {e}")))?;

    Ok(query)
}

/// Write one length-prefixed DNS message.
async fn write_framed(stream: &mut TcpStream, message: &[u8]) -> DnsResult<()> {
    let prefix = u16::try_from(message.len())
        .map_err(|_| DnsError::internal(format!("response too large: {} bytes", message.len())))?
        .to_be_bytes();
    stream
        .write_all(&prefix)
        .await
        .map_err(|e| DnsError::network_io("failed to write length prefix", e))?;
    stream
        .write_all(message)
        .await
        .map_err(|e| DnsError::network_io("failed to write message", e))?;
    Ok(())
}
