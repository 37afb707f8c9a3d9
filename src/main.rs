//! dnsmesh entry point.
//!
//! Wires the pieces together: one UDP listener, one TCP listener, the
//! metrics endpoint, and, when a controller is configured, the policy
//! fetcher and the hot-swap loop.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dnsmesh::config::{doh_timeout_from_env, Args, TlsStore};
use dnsmesh::error::DnsResult;
use dnsmesh::policy::{
    run_update_loop, DohModeCallback, OperationalMode, PolicyFetcher, TlsData, TlsUpdateCallback,
    UPDATE_CHANNEL_CAPACITY,
};
use dnsmesh::server::{DnsHandler, HandlerConfig, TcpDnsServer, UdpDnsServer};
use dnsmesh::upstream::DohTlsConfig;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "dnsmesh=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> DnsResult<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        error!("rustls crypto provider was already installed");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| dnsmesh::DnsError::internal(format!("failed to build runtime: {e}")))?
        .block_on(run(args))
}

async fn run(args: Args) -> DnsResult<()> {
    info!(version = dnsmesh::VERSION, "starting dnsmesh");
    info!(listen = %args.listen, upstream = %args.upstream, metrics = %args.metrics, "configuration");

    let tls_store = Arc::new(TlsStore::new());

    let handler = Arc::new(DnsHandler::new(
        HandlerConfig {
            upstream: args.upstream.clone(),
            doh_enabled: args.https_mode,
            doh_upstream: args.https_upstream.clone(),
            doh_timeout: doh_timeout_from_env(),
            tls: DohTlsConfig {
                ca_cert_path: args.tls_ca_cert.clone(),
                client_cert_path: args.tls_client_cert.clone(),
                client_key_path: args.tls_client_key.clone(),
                insecure_skip_verify: args.tls_insecure_skip_verify,
                ..DohTlsConfig::default()
            },
        },
        Arc::clone(&tls_store),
    ));

    // Metrics endpoint.
    let metrics_addr = args.metrics;
    tokio::spawn(async move {
        if let Err(e) = dnsmesh::metrics::serve(metrics_addr).await {
            error!(error = %e, "metrics server failed");
        }
    });

    // Policy plumbing: fetcher -> update channel -> hot-swap loop.
    if let Some(controller_url) = args.controller.clone() {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        tokio::spawn(run_update_loop(updates_rx, Arc::clone(&handler)));

        let on_tls_update: TlsUpdateCallback = {
            let tls_store = Arc::clone(&tls_store);
            let handler = Arc::clone(&handler);
            Arc::new(move |data: &TlsData| {
                match tls_store.update_from_base64(
                    &data.certificate,
                    &data.private_key,
                    &data.ca_certificate,
                ) {
                    Ok(()) => handler.refresh_doh_client(),
                    Err(e) => error!(error = %e, "failed to decode TLS material from controller"),
                }
            })
        };

        let on_doh_mode: DohModeCallback = {
            let handler = Arc::clone(&handler);
            Arc::new(move |enabled: bool| handler.set_doh_mode(enabled))
        };

        let fetcher = PolicyFetcher::new(
            controller_url,
            Arc::new(AtomicU64::new(args.fetch_interval.max(1))),
            handler.dry_run_flag(),
            OperationalMode::from_env(),
            updates_tx,
            on_tls_update,
            on_doh_mode,
        )?;
        tokio::spawn(fetcher.run());
    } else {
        info!("no controller configured; running with an empty block policy");
    }

    let udp = UdpDnsServer::bind(args.listen, Arc::clone(&handler)).await?;
    let tcp = TcpDnsServer::bind(args.listen, Arc::clone(&handler)).await?;

    tokio::try_join!(udp.run(), tcp.run())?;
    Ok(())
}
