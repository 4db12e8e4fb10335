//! probe — Heterogeneous endpoint probes (HTTP/HTTPS, TCP, DNS, TLS).
//!
//! Each checker turns one target into a [`ProbeResult`]. A checker returns
//! `Ok(result)` for a completed observation (up, or a definitive semantic
//! failure such as a wrong status code), and `Err(ProbeError)` when the
//! attempt failed in transport. Only transient transport errors are retried,
//! with exponential backoff, so total wall-clock time is bounded by
//! `timeout × (retries + 1) + Σ backoff`.

mod dns;
mod http;
mod tcp;
mod tls;

use crate::error::ProbeError;
use crate::types::{Target, TargetKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};

/// Certificate metadata captured by HTTPS/TLS probes.
///
/// Carried on its own struct rather than smuggled through the headers map;
/// the `tls.*` header keys are written additionally for display only.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsInfo {
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_remaining: i32,
}

/// Outcome of one probe cycle for a target.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub success: bool,
    pub status_code: Option<i32>,
    /// Wall-clock seconds for the observation, absent when the attempt
    /// never produced one.
    pub response_time: Option<f64>,
    pub response_size: Option<i64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub tls: Option<TlsInfo>,
    pub dns_time: Option<f64>,
    pub connect_time: Option<f64>,
    pub resolved_ip: Option<String>,
    pub tls_verified: Option<bool>,
    pub headers: HashMap<String, String>,
    pub retries_used: i32,
}

impl ProbeResult {
    pub fn ok(response_time: f64) -> Self {
        Self {
            success: true,
            response_time: Some(response_time),
            ..Self::default()
        }
    }

    /// Definitive semantic failure with whatever detail the attempt yielded.
    pub fn failed(err: &ProbeError) -> Self {
        Self {
            success: false,
            error_kind: Some(err.kind().to_string()),
            error_message: Some(err.to_string()),
            ..Self::default()
        }
    }

    /// Terminal transport failure after the retry budget was spent.
    pub fn from_error(err: &ProbeError, retries_used: i32) -> Self {
        let mut result = Self::failed(err);
        result.retries_used = retries_used;
        result
    }
}

/// Shared probe state: one HTTP client and one DNS resolver reused across
/// all probe tasks. The client carries the default User-Agent and a 10 s
/// connect timeout; per-target total timeouts are applied per request, so
/// the effective connect bound is `min(timeout, 10)`.
pub struct Prober {
    http: reqwest::Client,
    resolver: TokioAsyncResolver,
    /// Fallback expected-status set for targets that configure none.
    default_expected_status: Vec<i32>,
}

impl Prober {
    pub fn new(
        app_name: &str,
        app_version: &str,
        default_expected_status: Vec<i32>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("{app_name}/{app_version}"))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(Self {
            http,
            resolver,
            default_expected_status,
        })
    }

    /// Run the probe for `target`, retrying transient transport errors with
    /// exponential backoff up to the target's retry budget.
    pub async fn run(&self, target: &Target) -> ProbeResult {
        let timeout = Duration::from_secs(target.timeout_secs.max(1) as u64);
        let retries = target.retry_count.max(0) as u32;
        let mut attempt: u32 = 0;
        loop {
            let outcome = match target.kind {
                TargetKind::Http | TargetKind::Https => {
                    http::check(&self.http, target, timeout, &self.default_expected_status).await
                }
                TargetKind::Tcp => tcp::check(target, timeout).await,
                TargetKind::Dns => dns::check(&self.resolver, target, timeout).await,
                TargetKind::Tls => tls::check(target, timeout).await,
            };
            match outcome {
                Ok(mut result) => {
                    result.retries_used = attempt as i32;
                    return result;
                }
                Err(err) if err.is_transient() && attempt < retries => {
                    let delay = backoff_delay(target.retry_delay_secs.max(0) as u64, attempt);
                    debug!(
                        target_id = target.id,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient probe error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return ProbeResult::from_error(&err, attempt as i32),
            }
        }
    }
}

/// Exponential backoff with a small jitter, capped at one minute.
pub(crate) fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    use rand::Rng;
    let base = base_secs.max(1);
    let exp = base.saturating_mul(1u64 << attempt.min(6)).min(60);
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(exp * 1000 + jitter)
}

/// Extract the bare host from a target URL, tolerating scheme-less input.
pub(crate) fn host_of(raw: &str) -> Result<String, ProbeError> {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        let parsed =
            url::Url::parse(trimmed).map_err(|e| ProbeError::InvalidUrl(e.to_string()))?;
        return parsed
            .host_str()
            .map(str::to_owned)
            .ok_or_else(|| ProbeError::InvalidUrl(format!("no host in {trimmed}")));
    }
    let bare = trimmed
        .split('/')
        .next()
        .unwrap_or(trimmed)
        .split(':')
        .next()
        .unwrap_or(trimmed);
    if bare.is_empty() {
        return Err(ProbeError::InvalidUrl(format!("no host in {raw}")));
    }
    Ok(bare.to_string())
}

/// Extract `(host, port)` from a target URL, with a kind-specific default
/// port when none is given.
pub(crate) fn host_port(raw: &str, default_port: u16) -> Result<(String, u16), ProbeError> {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        let parsed =
            url::Url::parse(trimmed).map_err(|e| ProbeError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .map(str::to_owned)
            .ok_or_else(|| ProbeError::InvalidUrl(format!("no host in {trimmed}")))?;
        let port = parsed
            .port_or_known_default()
            .unwrap_or(default_port);
        return Ok((host, port));
    }
    let bare = trimmed.split('/').next().unwrap_or(trimmed);
    match bare.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| ProbeError::InvalidUrl(format!("bad port in {raw}")))?;
            Ok((host.to_string(), port))
        }
        _ if !bare.is_empty() => Ok((bare.to_string(), default_port)),
        _ => Err(ProbeError::InvalidUrl(format!("no host in {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_handles_schemes_and_bare_names() {
        assert_eq!(host_of("https://example.com/path").unwrap(), "example.com");
        assert_eq!(host_of("example.com").unwrap(), "example.com");
        assert_eq!(host_of("example.com:8080/x").unwrap(), "example.com");
        assert!(host_of("").is_err());
    }

    #[test]
    fn host_port_defaults_and_overrides() {
        assert_eq!(
            host_port("example.com", 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            host_port("example.com:9000", 80).unwrap(),
            ("example.com".to_string(), 9000)
        );
        assert_eq!(
            host_port("https://example.com", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            host_port("https://example.com:8443", 443).unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert!(host_port("example.com:notaport", 80).is_err());
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let first = backoff_delay(2, 0);
        let second = backoff_delay(2, 1);
        let huge = backoff_delay(2, 30);
        assert!(first >= Duration::from_secs(2));
        assert!(second >= Duration::from_secs(4));
        assert!(huge <= Duration::from_secs(61));
    }

    #[test]
    fn from_error_fills_failure_fields() {
        let err = ProbeError::ConnectRefused;
        let result = ProbeResult::from_error(&err, 2);
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("connect_refused"));
        assert_eq!(result.retries_used, 2);
        assert!(result.response_time.is_none());
    }
}
