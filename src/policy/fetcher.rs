//! Policy fetcher.
//!
//! A process-wide singleton task that pulls the policy from the controller:
//! once immediately at startup, then on every tick of a mutable interval the
//! controller itself can adjust. Fetch failures are handled by the
//! operational mode, never propagated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::types::{ControllerResponse, TlsData};
use crate::error::{DnsError, DnsResult};
use crate::metrics::{ERRORS_TOTAL, ERROR_TYPE_POLICY_FETCH, POLICY_RULES};

/// Env var carrying the workload's config hash, passed through to the
/// controller as the `hash` query parameter.
pub const CONFIG_HASH_ENV: &str = "DNS_MESH_CONFIG_HASH";

/// Env var selecting the operational mode.
pub const OPERATIONAL_MODE_ENV: &str = "DNS_MESH_OPERATIONAL_MODE";

/// Controller HTTP client timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked with controller-pushed TLS material.
pub type TlsUpdateCallback = Arc<dyn Fn(&TlsData) + Send + Sync>;

/// Callback invoked with the DoH mode flag on every successful fetch.
pub type DohModeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Failure policy applied when the controller cannot be reached or its
/// response cannot be used.
///
/// - `Strict` fails closed: a synthetic catch-all (`["*"]`) policy is
///   published, blocking every query.
/// - `Balance` fails open with telemetry: the dry-run flag is raised so the
///   existing matcher keeps logging would-block decisions while everything
///   is forwarded.
/// - `Passive` leaves the previously fetched policy in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalMode {
    /// Fail closed via the catch-all rule.
    Strict,
    /// Fail open via dry-run.
    Balance,
    /// No failure override.
    Passive,
}

impl OperationalMode {
    /// Parse a mode string; anything but `strict`/`balance` is passive.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "strict" => Self::Strict,
            "balance" => Self::Balance,
            _ => Self::Passive,
        }
    }

    /// Read the mode from `DNS_MESH_OPERATIONAL_MODE`.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(OPERATIONAL_MODE_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or(Self::Passive)
    }
}

/// Periodic policy puller.
pub struct PolicyFetcher {
    controller_url: String,
    interval_secs: Arc<AtomicU64>,
    dry_run: Arc<AtomicBool>,
    mode: OperationalMode,
    updates: mpsc::Sender<Vec<String>>,
    http: reqwest::Client,
    on_tls_update: TlsUpdateCallback,
    on_doh_mode: DohModeCallback,
}

impl PolicyFetcher {
    /// Create a fetcher.
    ///
    /// `interval_secs` is shared: successful fetches write the controller's
    /// interval into it and the next tick is scheduled from the new value.
    /// `dry_run` is the flag shared with the query handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        controller_url: impl Into<String>,
        interval_secs: Arc<AtomicU64>,
        dry_run: Arc<AtomicBool>,
        mode: OperationalMode,
        updates: mpsc::Sender<Vec<String>>,
        on_tls_update: TlsUpdateCallback,
        on_doh_mode: DohModeCallback,
    ) -> DnsResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| DnsError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            controller_url: controller_url.into(),
            interval_secs,
            dry_run,
            mode,
            updates,
            http,
            on_tls_update,
            on_doh_mode,
        })
    }

    /// Run the fetch loop forever.
    ///
    /// Reads `DNS_MESH_CONFIG_HASH` once at startup. An empty hash is logged
    /// and execution continues; the controller will reject the hash-less
    /// request and the operational mode takes over from there.
    pub async fn run(self) {
        let config_hash = std::env::var(CONFIG_HASH_ENV).unwrap_or_default();
        if config_hash.is_empty() {
            error!(
                env = CONFIG_HASH_ENV,
                "config hash is not set; policy fetches will likely fail"
            );
        }

        info!(
            controller = %self.controller_url,
            interval_secs = self.interval_secs.load(Ordering::Relaxed),
            mode = ?self.mode,
            "starting policy fetcher"
        );

        loop {
            self.poll(&config_hash).await;

            let interval = self.interval_secs.load(Ordering::Relaxed).max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    /// One fetch cycle: pull, apply on success, fall back by mode on error.
    pub async fn poll(&self, config_hash: &str) {
        match self.fetch(config_hash).await {
            Ok(response) => self.apply(response).await,
            Err(e) => {
                error!(error = %e, controller = %self.controller_url, "policy fetch failed");
                self.apply_failure_mode().await;
            }
        }
    }

    /// Fetch and decode the controller response.
    async fn fetch(&self, config_hash: &str) -> DnsResult<ControllerResponse> {
        let url = format!(
            "{}/api/policies?hash={}",
            self.controller_url, config_hash
        );
        debug!(url = %url, "fetching policies");

        let response = self.http.get(&url).send().await.map_err(|e| {
            ERRORS_TOTAL
                .with_label_values(&[ERROR_TYPE_POLICY_FETCH, "policy_upstream"])
                .inc();
            DnsError::policy_fetch("transport", e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            ERRORS_TOTAL
                .with_label_values(&[ERROR_TYPE_POLICY_FETCH, "policy_upstream_http_err"])
                .inc();
            return Err(DnsError::policy_fetch(
                "status",
                format!("unexpected status code from controller: {status}"),
            ));
        }

        response.json::<ControllerResponse>().await.map_err(|e| {
            ERRORS_TOTAL
                .with_label_values(&[ERROR_TYPE_POLICY_FETCH, "policy_upstream_decode_err"])
                .inc();
            DnsError::policy_fetch("decode", e.to_string())
        })
    }

    /// Apply a successfully fetched policy.
    async fn apply(&self, response: ControllerResponse) {
        let spec = response.policy.spec;

        // DoH mode first: the TLS callback below assumes the mode decision
        // is already in place when it rebuilds the client.
        (self.on_doh_mode)(spec.doh);

        if spec.doh {
            if let Some(tls_data) = &response.tls_data {
                (self.on_tls_update)(tls_data);
            }
        }

        let rule_count = spec.block_list.len();
        if self.updates.send(spec.block_list).await.is_err() {
            error!("policy update channel closed; dropping block list");
            return;
        }

        self.dry_run.store(spec.dry_run, Ordering::Relaxed);

        if spec.interval > 0 {
            self.interval_secs.store(spec.interval, Ordering::Relaxed);
        }

        POLICY_RULES.set(i64::try_from(rule_count).unwrap_or(i64::MAX));

        info!(
            rules = rule_count,
            dry_run = spec.dry_run,
            doh = spec.doh,
            "policies fetched successfully"
        );
    }

    /// Fall back according to the operational mode.
    async fn apply_failure_mode(&self) {
        match self.mode {
            OperationalMode::Strict => {
                warn!("operational mode strict: publishing catch-all block policy");
                if self.updates.send(vec!["*".to_string()]).await.is_err() {
                    error!("policy update channel closed; cannot fail closed");
                }
            }
            OperationalMode::Balance => {
                warn!("operational mode balance: enabling dry-run");
                self.dry_run.store(true, Ordering::Relaxed);
            }
            OperationalMode::Passive => {
                debug!("no operational mode override; keeping previous policy");
            }
        }
    }
}

impl std::fmt::Debug for PolicyFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyFetcher")
            .field("controller_url", &self.controller_url)
            .field("mode", &self.mode)
            .field("interval_secs", &self.interval_secs.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FetcherFixture {
        fetcher: PolicyFetcher,
        updates: mpsc::Receiver<Vec<String>>,
        dry_run: Arc<AtomicBool>,
        interval: Arc<AtomicU64>,
        tls_calls: Arc<AtomicUsize>,
        doh_calls: Arc<AtomicUsize>,
    }

    fn fixture(controller_url: &str, mode: OperationalMode) -> FetcherFixture {
        let (tx, rx) = mpsc::channel(10);
        let dry_run = Arc::new(AtomicBool::new(false));
        let interval = Arc::new(AtomicU64::new(30));
        let tls_calls = Arc::new(AtomicUsize::new(0));
        let doh_calls = Arc::new(AtomicUsize::new(0));

        let tls_counter = Arc::clone(&tls_calls);
        let doh_counter = Arc::clone(&doh_calls);

        let fetcher = PolicyFetcher::new(
            controller_url,
            Arc::clone(&interval),
            Arc::clone(&dry_run),
            mode,
            tx,
            Arc::new(move |_data: &TlsData| {
                tls_counter.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_enabled: bool| {
                doh_counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        FetcherFixture {
            fetcher,
            updates: rx,
            dry_run,
            interval,
            tls_calls,
            doh_calls,
        }
    }

    /// One-shot HTTP stub that answers any request with the given body.
    async fn http_stub(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(OperationalMode::parse("strict"), OperationalMode::Strict);
        assert_eq!(OperationalMode::parse("balance"), OperationalMode::Balance);
        assert_eq!(OperationalMode::parse("anything"), OperationalMode::Passive);
        assert_eq!(OperationalMode::parse(""), OperationalMode::Passive);
    }

    #[tokio::test]
    async fn strict_mode_fails_closed() {
        let mut fx = fixture("http://127.0.0.1:1", OperationalMode::Strict);

        fx.fetcher.poll("testhash").await;

        let update = fx.updates.recv().await.unwrap();
        assert_eq!(update, vec!["*".to_string()]);
        assert!(!fx.dry_run.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn balance_mode_fails_open() {
        let mut fx = fixture("http://127.0.0.1:1", OperationalMode::Balance);

        fx.fetcher.poll("testhash").await;

        assert!(fx.dry_run.load(Ordering::SeqCst));
        assert!(fx.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn passive_mode_keeps_previous_policy() {
        let mut fx = fixture("http://127.0.0.1:1", OperationalMode::Passive);

        fx.fetcher.poll("testhash").await;

        assert!(!fx.dry_run.load(Ordering::SeqCst));
        assert!(fx.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_200_triggers_failure_mode() {
        let url = http_stub("500 Internal Server Error", String::new()).await;
        let mut fx = fixture(&url, OperationalMode::Strict);

        fx.fetcher.poll("testhash").await;

        assert_eq!(fx.updates.recv().await.unwrap(), vec!["*".to_string()]);
    }

    #[tokio::test]
    async fn decode_error_triggers_failure_mode() {
        let url = http_stub("200 OK", "not json at all".to_string()).await;
        let mut fx = fixture(&url, OperationalMode::Balance);

        fx.fetcher.poll("testhash").await;

        assert!(fx.dry_run.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn success_applies_policy() {
        let body = r#"{
            "policy": {"spec": {
                "blockList": ["ads.example.com", "*.tracker.net"],
                "dryrun": true,
                "doh": false,
                "interval": 120
            }}
        }"#;
        let url = http_stub("200 OK", body.to_string()).await;
        let mut fx = fixture(&url, OperationalMode::Strict);

        fx.fetcher.poll("testhash").await;

        let update = fx.updates.recv().await.unwrap();
        assert_eq!(update, vec!["ads.example.com", "*.tracker.net"]);
        assert!(fx.dry_run.load(Ordering::SeqCst));
        assert_eq!(fx.interval.load(Ordering::SeqCst), 120);

        // DoH callback fires on every success; TLS callback needs doh=true.
        assert_eq!(fx.doh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.tls_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tls_callback_fires_once_with_doh_and_tls_data() {
        let body = r#"{
            "policy": {"spec": {"blockList": [], "doh": true}},
            "tlsData": {"certificate": "Y2VydA==", "privateKey": "a2V5", "caCertificate": ""}
        }"#;
        let url = http_stub("200 OK", body.to_string()).await;
        let mut fx = fixture(&url, OperationalMode::Passive);

        fx.fetcher.poll("testhash").await;

        let _ = fx.updates.recv().await.unwrap();
        assert_eq!(fx.tls_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.doh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_interval_is_not_applied() {
        let body = r#"{"policy": {"spec": {"blockList": [], "interval": 0}}}"#;
        let url = http_stub("200 OK", body.to_string()).await;
        let mut fx = fixture(&url, OperationalMode::Passive);

        fx.fetcher.poll("testhash").await;

        let _ = fx.updates.recv().await.unwrap();
        assert_eq!(fx.interval.load(Ordering::SeqCst), 30);
    }
}
