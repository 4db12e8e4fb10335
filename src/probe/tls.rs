//! TLS probe: handshakes on port 443 (or the URL's port) with certificate
//! verification disabled, so an expired or untrusted certificate can still
//! be inspected and reported. The peer certificate is parsed for validity
//! window, issuer and subject; success means `now` lies inside the window.

use super::{ProbeResult, TlsInfo, host_port};
use crate::error::ProbeError;
use crate::types::Target;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use x509_parser::prelude::{FromDer, X509Certificate};

pub(super) async fn check(target: &Target, timeout: Duration) -> Result<ProbeResult, ProbeError> {
    let (host, port) = host_port(&target.url, 443)?;
    let addr = format!("{host}:{port}");
    let started = Instant::now();

    let tcp = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(ProbeError::ConnectRefused);
        }
        Ok(Err(e)) => return Err(ProbeError::Network(e.to_string())),
        Err(_) => return Err(ProbeError::ConnectTimeout(timeout)),
    };
    let connect_time = started.elapsed().as_secs_f64();

    // Verification off on purpose: the point is to look at the certificate,
    // not to trust it.
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let handshake = tokio::time::timeout(timeout, connector.connect(&host, tcp)).await;
    let stream = match handshake {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProbeError::Network(format!("tls handshake failed: {e}"))),
        Err(_) => return Err(ProbeError::ReadTimeout(timeout)),
    };

    let cert = stream
        .get_ref()
        .peer_certificate()
        .map_err(|e| ProbeError::Network(e.to_string()))?
        .ok_or_else(|| ProbeError::CertInvalid("no peer certificate presented".into()))?;
    let der = cert
        .to_der()
        .map_err(|e| ProbeError::CertInvalid(e.to_string()))?;
    let elapsed = started.elapsed().as_secs_f64();

    let info = parse_certificate(&der, Utc::now())?;
    let valid = Utc::now() >= info.not_before && Utc::now() <= info.not_after;

    let mut result = ProbeResult::ok(elapsed);
    result.connect_time = Some(connect_time);
    result.tls_verified = Some(valid);
    result.headers = tls_headers(&info);
    if !valid {
        let err = if info.days_remaining < 0 {
            ProbeError::CertInvalid(format!(
                "certificate expired {} days ago",
                -i64::from(info.days_remaining)
            ))
        } else {
            ProbeError::CertInvalid("certificate not yet valid".into())
        };
        result.success = false;
        result.error_kind = Some(err.kind().to_string());
        result.error_message = Some(err.to_string());
    }
    result.tls = Some(info);
    Ok(result)
}

/// Parse DER certificate bytes into the metadata carrier.
fn parse_certificate(der: &[u8], now: DateTime<Utc>) -> Result<TlsInfo, ProbeError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| ProbeError::CertInvalid(e.to_string()))?;

    let not_before = DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| ProbeError::CertInvalid("unrepresentable notBefore".into()))?;
    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| ProbeError::CertInvalid("unrepresentable notAfter".into()))?;

    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned);
    let subject = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned);

    let days_remaining = (not_after - now).num_days() as i32;

    Ok(TlsInfo {
        issuer,
        subject,
        not_before,
        not_after,
        days_remaining,
    })
}

/// Display-parity keys; [`TlsInfo`] is the carrier the recorder reads.
fn tls_headers(info: &TlsInfo) -> std::collections::HashMap<String, String> {
    let mut headers = std::collections::HashMap::new();
    if let Some(issuer) = &info.issuer {
        headers.insert("tls.issuer".to_string(), issuer.clone());
    }
    if let Some(subject) = &info.subject {
        headers.insert("tls.subject".to_string(), subject.clone());
    }
    headers.insert("tls.expiry".to_string(), info.not_after.to_rfc3339());
    headers.insert(
        "tls.daysRemaining".to_string(),
        info.days_remaining.to_string(),
    );
    headers.insert("tls.notBefore".to_string(), info.not_before.to_rfc3339());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn tls_headers_carry_capture_keys() {
        let info = TlsInfo {
            issuer: Some("R11".into()),
            subject: Some("example.com".into()),
            not_before: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
            days_remaining: 42,
        };
        let headers = tls_headers(&info);
        assert_eq!(headers.get("tls.issuer").unwrap(), "R11");
        assert_eq!(headers.get("tls.daysRemaining").unwrap(), "42");
        assert!(headers.contains_key("tls.expiry"));
        assert!(headers.contains_key("tls.notBefore"));
    }
}
