//! error.rs — Error taxonomy for probes, alert delivery and storage.
//!
//! Probe errors carry a stable `kind()` token that is persisted into
//! `probe_logs.error_kind`, and a transient/semantic classification that
//! decides whether the probe retry loop runs again.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single probe attempt.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("dns lookup timed out")]
    DnsTimeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("connection refused")]
    ConnectRefused,
    #[error("unexpected status code {got}")]
    WrongStatus { got: u16 },
    #[error("response body missing expected content")]
    ContentMismatch,
    #[error("tls verification failed: {0}")]
    TlsVerify(String),
    #[error("certificate invalid: {0}")]
    CertInvalid(String),
    #[error("hostname does not exist")]
    NxDomain,
    #[error("no {0} records in answer")]
    NoAnswer(String),
    #[error("invalid target url: {0}")]
    InvalidUrl(String),
}

impl ProbeError {
    /// Stable token persisted into `probe_logs.error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::ConnectTimeout(_) => "connect_timeout",
            ProbeError::ReadTimeout(_) => "read_timeout",
            ProbeError::DnsTimeout => "dns_timeout",
            ProbeError::Network(_) => "network",
            ProbeError::ConnectRefused => "connect_refused",
            ProbeError::WrongStatus { .. } => "wrong_status",
            ProbeError::ContentMismatch => "content_mismatch",
            ProbeError::TlsVerify(_) => "tls_verify",
            ProbeError::CertInvalid(_) => "cert_invalid",
            ProbeError::NxDomain => "nxdomain",
            ProbeError::NoAnswer(_) => "no_answer",
            ProbeError::InvalidUrl(_) => "invalid_url",
        }
    }

    /// Transient errors are retried inside the probe with backoff.
    /// Semantic failures (wrong status, refused, bad cert, NXDOMAIN) are
    /// final for the cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProbeError::ConnectTimeout(_)
                | ProbeError::ReadTimeout(_)
                | ProbeError::DnsTimeout
                | ProbeError::Network(_)
        )
    }
}

/// Failure reported by the messaging sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Worth retrying with backoff (network blip, 429, 5xx).
    #[error("transient sink error: {0}")]
    Transient(String),
    /// No point retrying (unknown recipient, blocked bot, malformed payload).
    #[error("permanent sink error: {0}")]
    Permanent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        assert!(ProbeError::ConnectTimeout(Duration::from_secs(5)).is_transient());
        assert!(ProbeError::ReadTimeout(Duration::from_secs(5)).is_transient());
        assert!(ProbeError::DnsTimeout.is_transient());
        assert!(ProbeError::Network("reset by peer".into()).is_transient());
    }

    #[test]
    fn semantic_failures_are_final() {
        assert!(!ProbeError::WrongStatus { got: 503 }.is_transient());
        assert!(!ProbeError::ConnectRefused.is_transient());
        assert!(!ProbeError::NxDomain.is_transient());
        assert!(!ProbeError::TlsVerify("self signed".into()).is_transient());
        assert!(!ProbeError::ContentMismatch.is_transient());
    }

    #[test]
    fn kind_tokens_are_stable() {
        assert_eq!(ProbeError::NxDomain.kind(), "nxdomain");
        assert_eq!(ProbeError::WrongStatus { got: 404 }.kind(), "wrong_status");
        assert_eq!(
            ProbeError::ConnectTimeout(Duration::from_secs(1)).kind(),
            "connect_timeout"
        );
    }
}
