//! Controller response contract.
//!
//! The controller answers `GET /api/policies?hash=...` with a policy
//! envelope. Only `spec.blockList`, `spec.dryrun`, `spec.doh`,
//! `spec.interval` and the optional `tlsData` triple are consumed; the rest
//! of the envelope (selector, allow list, status) is decoded and ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level controller response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerResponse {
    /// The DNS policy object.
    pub policy: DnsPolicy,
    /// Optional TLS material for DoH mutual TLS.
    pub tls_data: Option<TlsData>,
}

/// A DNS policy object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsPolicy {
    /// Policy spec; the only part the proxy acts on.
    pub spec: PolicySpec,
    /// Opaque object metadata.
    pub metadata: serde_json::Value,
    /// Controller-side status.
    pub status: PolicyStatus,
}

/// The policy spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicySpec {
    /// Workload selector, unused by the proxy.
    pub target_selector: HashMap<String, String>,
    /// Allow list, unused by the proxy.
    pub allow_list: Vec<String>,
    /// Domains to block; full replacement on every update.
    pub block_list: Vec<String>,
    /// When true, matches are logged but not blocked.
    #[serde(rename = "dryrun")]
    pub dry_run: bool,
    /// When true, forward queries over DNS-over-HTTPS.
    pub doh: bool,
    /// Fetch interval in seconds for future ticks.
    pub interval: u64,
}

/// Controller-side policy status. Decoded for completeness, unused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Hash of the workload selector.
    pub selector_hash: String,
    /// Hash of the spec.
    pub spec_hash: String,
    /// Generation observed by the controller.
    pub observed_generation: i64,
}

/// Base64-encoded TLS material for DoH mutual TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsData {
    /// Client certificate, base64-encoded PEM.
    pub certificate: String,
    /// Client private key, base64-encoded PEM.
    pub private_key: String,
    /// CA certificate, base64-encoded PEM.
    pub ca_certificate: String,
}
