//! Error types for the DNS proxy.
//!
//! Every failure on the query path or the policy path is a [`DnsError`].
//! Errors never cross a query boundary: a worker that hits one logs it,
//! bumps the matching counter and returns.
//!
//! # Example
//!
//! ```
//! use dnsmesh::error::DnsError;
//! use std::time::Duration;
//!
//! let err = DnsError::timeout("query to 1.1.1.1:53", Duration::from_secs(5));
//! assert!(err.is_timeout());
//! assert_eq!(err.metric_label(), "upstream_timeout");
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type DnsResult<T> = Result<T, DnsError>;

/// Which upstream I/O operation failed.
///
/// Drives the `type` label on the `dns_errors_total` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStage {
    /// Connecting / resolving the upstream address
    Dial,
    /// Writing the query
    Write,
    /// Reading the response
    Read,
}

impl UpstreamStage {
    /// Metric label for this stage.
    #[must_use]
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Dial => "upstream_dial",
            Self::Write => "upstream_write",
            Self::Read => "upstream_read",
        }
    }
}

/// Error type for DNS proxy operations.
#[derive(Debug, Error)]
pub enum DnsError {
    /// A client query could not be decoded.
    #[error("failed to parse DNS message: {reason}")]
    Parse {
        /// What went wrong during parsing
        reason: String,
    },

    /// Low-level socket failure (bind, local I/O, client write).
    #[error("network error: {reason}")]
    Network {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// An upstream round-trip exceeded its deadline.
    #[error("DNS operation timed out after {timeout:?}: {context}")]
    Timeout {
        /// What timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// Upstream resolver communication failure.
    #[error("upstream error ({upstream}): {reason}")]
    Upstream {
        /// The upstream server address or URL
        upstream: String,
        /// The I/O stage that failed
        stage: UpstreamStage,
        /// Description of the failure
        reason: String,
    },

    /// TLS material could not be loaded or parsed.
    #[error("TLS configuration error: {reason}")]
    Tls {
        /// Description of the TLS failure
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field at fault, if applicable
        field: Option<String>,
    },

    /// Policy fetch from the controller failed (transport, status or decode).
    #[error("policy fetch failed ({kind}): {reason}")]
    PolicyFetch {
        /// Failure subtype: `transport`, `status` or `decode`
        kind: &'static str,
        /// Description of the failure
        reason: String,
    },

    /// Unexpected internal error; should be rare.
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    /// Create a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a network error.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error for a given I/O stage.
    pub fn upstream(
        upstream: impl Into<String>,
        stage: UpstreamStage,
        reason: impl Into<String>,
    ) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            stage,
            reason: reason.into(),
        }
    }

    /// Create a TLS error.
    pub fn tls(reason: impl Into<String>) -> Self {
        Self::Tls {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error with field context.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a policy fetch error.
    pub fn policy_fetch(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::PolicyFetch {
            kind,
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether retrying the operation could plausibly succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Upstream { .. }
                | Self::Network { .. }
                | Self::PolicyFetch { .. }
        )
    }

    /// The `type` label used on `dns_errors_total` for this error.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Timeout { .. } => "upstream_timeout",
            Self::Upstream { stage, .. } => stage.metric_label(),
            Self::Network { .. } => "client_write",
            Self::PolicyFetch { .. } => "policy_fetch",
            Self::Tls { .. } | Self::Config { .. } | Self::Internal { .. } => "internal",
        }
    }
}
