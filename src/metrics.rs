//! Prometheus metrics surface.
//!
//! Counters and histograms for the query path, an error counter labelled by
//! failure type, and a gauge tracking the size of the active block policy.
//! The `/metrics` endpoint is served by a minimal hyper server running in
//! its own task.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{DnsError, DnsResult};

/// Error type label: client wire data could not be parsed.
pub const ERROR_TYPE_PARSE: &str = "parse";
/// Error type label: response could not be written back to the client.
pub const ERROR_TYPE_CLIENT_WRITE: &str = "client_write";
/// Error type label: policy fetch failed.
pub const ERROR_TYPE_POLICY_FETCH: &str = "policy_fetch";

lazy_static! {
    /// Total DNS queries received, by protocol.
    pub static ref QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dns_queries_total",
        "Total number of DNS queries received",
        &["protocol"]
    )
    .expect("metric registration");

    /// Queries answered with a synthesized NXDOMAIN.
    pub static ref QUERIES_BLOCKED: IntCounterVec = register_int_counter_vec!(
        "dns_queries_blocked_total",
        "Total number of DNS queries blocked",
        &["protocol"]
    )
    .expect("metric registration");

    /// Queries forwarded upstream and answered.
    pub static ref QUERIES_ALLOWED: IntCounterVec = register_int_counter_vec!(
        "dns_queries_allowed_total",
        "Total number of DNS queries allowed and forwarded",
        &["protocol"]
    )
    .expect("metric registration");

    /// Errors by type and protocol.
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dns_errors_total",
        "Total number of DNS errors by type",
        &["type", "protocol"]
    )
    .expect("metric registration");

    /// Query processing duration by protocol and outcome.
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "dns_query_duration_seconds",
        "DNS query processing duration in seconds",
        &["protocol", "status"]
    )
    .expect("metric registration");

    /// Number of rules in the active block policy.
    pub static ref POLICY_RULES: IntGauge = register_int_gauge!(
        "dns_policy_rules",
        "Number of entries in the active block policy"
    )
    .expect("metric registration");
}

/// Serve `/metrics` on the given address until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound; per-connection failures
/// are logged and do not stop the server.
pub async fn serve(addr: SocketAddr) -> DnsResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to bind metrics server to {addr}"), e))?;

    info!(addr = %addr, "metrics server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "metrics accept error");
                continue;
            }
        };

        tokio::spawn(async move {
            let result = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(handle_request))
                .await;
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "metrics connection error");
            }
        });
    }
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("static response"));
    }

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&prometheus::gather(), &mut buf) {
        Ok(()) => Ok(Response::builder()
            .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(buf)))
            .expect("static response")),
        Err(e) => Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::from(e.to_string())))
            .expect("static response")),
    }
}
