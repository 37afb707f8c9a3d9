//! DNS-over-HTTPS client (RFC 8484).
//!
//! A single HTTP/2 client per configuration epoch: it is built when DoH mode
//! activates or when TLS material changes, and queries observe it through
//! the handler's lock, so connection reuse survives across queries within an
//! epoch.
//!
//! TLS configuration supports a custom CA pool, a client keypair for mutual
//! TLS, and an insecure skip-verify switch. Certificate material can come
//! from in-memory PEM buffers (pushed by the controller) or from filesystem
//! paths; in-memory data takes precedence. A failure to load TLS material
//! falls back to the default configuration with a logged error; it never
//! takes the proxy down.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{DnsError, DnsResult, UpstreamStage};

/// Content type for DNS wire format over HTTPS.
pub const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// Maximum accepted DoH response size (TCP DNS message limit).
const MAX_DOH_RESPONSE: usize = 65_535;

/// TLS settings for the DoH client.
///
/// In-memory PEM buffers are preferred over file paths when both are set.
#[derive(Debug, Clone, Default)]
pub struct DohTlsConfig {
    /// CA certificate file for verifying the DoH server.
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate file for mTLS.
    pub client_cert_path: Option<PathBuf>,
    /// Client private key file for mTLS.
    pub client_key_path: Option<PathBuf>,
    /// In-memory CA certificate (PEM).
    pub ca_cert_pem: Option<Vec<u8>>,
    /// In-memory client certificate (PEM).
    pub client_cert_pem: Option<Vec<u8>>,
    /// In-memory client private key (PEM).
    pub client_key_pem: Option<Vec<u8>>,
    /// Disable server certificate verification. Testing only.
    pub insecure_skip_verify: bool,
}

impl DohTlsConfig {
    fn ca_pem(&self) -> DnsResult<Option<Vec<u8>>> {
        if let Some(pem) = &self.ca_cert_pem {
            return Ok(Some(pem.clone()));
        }
        match &self.ca_cert_path {
            Some(path) => std::fs::read(path).map(Some).map_err(|e| {
                DnsError::tls(format!("failed to read CA certificate {}: {e}", path.display()))
            }),
            None => Ok(None),
        }
    }

    fn client_keypair_pem(&self) -> DnsResult<Option<(Vec<u8>, Vec<u8>)>> {
        if let (Some(cert), Some(key)) = (&self.client_cert_pem, &self.client_key_pem) {
            return Ok(Some((cert.clone(), key.clone())));
        }
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).map_err(|e| {
                    DnsError::tls(format!(
                        "failed to read client certificate {}: {e}",
                        cert_path.display()
                    ))
                })?;
                let key = std::fs::read(key_path).map_err(|e| {
                    DnsError::tls(format!(
                        "failed to read client key {}: {e}",
                        key_path.display()
                    ))
                })?;
                Ok(Some((cert, key)))
            }
            _ => Ok(None),
        }
    }
}

/// DNS-over-HTTPS client.
///
/// Thread-safe; queries can run concurrently over the shared HTTP/2
/// transport.
pub struct DohClient {
    server_url: String,
    uri: Uri,
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
    query_timeout: Duration,
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("server_url", &self.server_url)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl DohClient {
    /// Build a client for the given endpoint.
    ///
    /// The URL must use the `https` scheme. TLS material that fails to load
    /// is logged and replaced by the default configuration (system roots,
    /// no client auth); only an invalid URL is a hard error.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` if the URL cannot be parsed or is not
    /// HTTPS.
    pub fn new(server_url: &str, query_timeout: Duration, tls: &DohTlsConfig) -> DnsResult<Self> {
        let uri: Uri = server_url.parse().map_err(|e| {
            DnsError::config_field(format!("invalid DoH URL '{server_url}': {e}"), "https-upstream")
        })?;

        if uri.scheme_str() != Some("https") {
            return Err(DnsError::config_field(
                format!(
                    "DoH URL must use the https scheme, got: {}",
                    uri.scheme_str().unwrap_or("none")
                ),
                "https-upstream",
            ));
        }

        let tls_config = match build_tls_config(tls) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "failed to load TLS material, using default TLS configuration");
                default_tls_config()
            }
        };

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_only()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(https);

        Ok(Self {
            server_url: server_url.to_string(),
            uri,
            client,
            query_timeout: query_timeout.max(Duration::from_secs(1)),
        })
    }

    /// The configured endpoint URL.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// The per-request timeout.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Send a wire-format DNS query and return the wire-format response.
    ///
    /// POST with `application/dns-message` in both directions. Success
    /// requires HTTP 200 and a matching response content type.
    ///
    /// # Errors
    ///
    /// Timeouts are reported as `DnsError::Timeout`; transport failures, bad
    /// statuses and content-type mismatches as upstream read errors.
    pub async fn query(&self, dns_query: &[u8]) -> DnsResult<Vec<u8>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .body(Full::new(Bytes::copy_from_slice(dns_query)))
            .map_err(|e| DnsError::internal(format!("failed to build DoH request: {e}")))?;

        let response = timeout(self.query_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                DnsError::timeout(format!("DoH request to {}", self.server_url), self.query_timeout)
            })?
            .map_err(|e| {
                DnsError::upstream(&self.server_url, UpstreamStage::Read, e.to_string())
            })?;

        let status = response.status();
        if status != http::StatusCode::OK {
            return Err(DnsError::upstream(
                &self.server_url,
                UpstreamStage::Read,
                format!("unexpected status code: {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with(DOH_CONTENT_TYPE) {
            return Err(DnsError::upstream(
                &self.server_url,
                UpstreamStage::Read,
                format!("unexpected content type: {content_type}"),
            ));
        }

        let body = timeout(self.query_timeout, response.into_body().collect())
            .await
            .map_err(|_| {
                DnsError::timeout(
                    format!("DoH response body from {}", self.server_url),
                    self.query_timeout,
                )
            })?
            .map_err(|e| {
                DnsError::upstream(&self.server_url, UpstreamStage::Read, e.to_string())
            })?
            .to_bytes();

        if body.len() > MAX_DOH_RESPONSE {
            return Err(DnsError::upstream(
                &self.server_url,
                UpstreamStage::Read,
                format!("response too large: {} bytes", body.len()),
            ));
        }

        Ok(body.to_vec())
    }
}

/// Default TLS configuration: Mozilla roots, no client auth, TLS 1.2+.
fn default_tls_config() -> ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Build a TLS configuration from the supplied material.
fn build_tls_config(tls: &DohTlsConfig) -> DnsResult<ClientConfig> {
    let builder = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ]);

    let builder = if tls.insecure_skip_verify {
        warn!("TLS certificate verification is disabled (insecure)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
    } else {
        let mut root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(pem) = tls.ca_pem()? {
            let certs = parse_certs(&pem)?;
            if certs.is_empty() {
                return Err(DnsError::tls("CA certificate PEM contains no certificates"));
            }
            let (added, _ignored) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(DnsError::tls("failed to parse CA certificate"));
            }
            info!("loaded custom CA certificate for DoH verification");
        }

        builder.with_root_certificates(root_store)
    };

    let config = match tls.client_keypair_pem()? {
        Some((cert_pem, key_pem)) => {
            let certs = parse_certs(&cert_pem)?;
            if certs.is_empty() {
                return Err(DnsError::tls("client certificate PEM contains no certificates"));
            }
            let key = parse_private_key(&key_pem)?;
            info!("loaded client certificate for DoH mutual TLS");
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| DnsError::tls(format!("invalid client certificate/key pair: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

fn parse_certs(pem: &[u8]) -> DnsResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut io::Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DnsError::tls(format!("failed to parse certificate PEM: {e}")))
}

fn parse_private_key(pem: &[u8]) -> DnsResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut io::Cursor::new(pem))
        .map_err(|e| DnsError::tls(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| DnsError::tls("private key PEM contains no key"))
}

/// Certificate verifier that accepts anything. Testing only.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
