//! HTTP/HTTPS probe: sends the configured method to the target URL and
//! judges the response against the expected status set and optional body
//! substring. Redirects are followed; the redirect chain's final status is
//! what gets judged.

use super::ProbeResult;
use crate::error::ProbeError;
use crate::types::Target;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub(super) async fn check(
    client: &reqwest::Client,
    target: &Target,
    timeout: Duration,
    default_expected_status: &[i32],
) -> Result<ProbeResult, ProbeError> {
    let method = reqwest::Method::from_bytes(target.method.as_bytes())
        .map_err(|_| ProbeError::InvalidUrl(format!("bad method {}", target.method)))?;

    let mut request = client
        .request(method, &target.url)
        .timeout(timeout);
    for (name, value) in &target.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &target.body {
        request = request.body(body.clone());
    }

    let started = Instant::now();
    let response = request.send().await.map_err(|e| classify(e, timeout))?;

    let status = response.status().as_u16();
    let captured = capture_headers(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(|e| classify(e, timeout))?;
    let elapsed = started.elapsed().as_secs_f64();

    let mut result = ProbeResult::ok(elapsed);
    result.status_code = Some(status as i32);
    result.response_size = Some(body.len() as i64);
    result.headers = captured;

    let expected: &[i32] = if target.expected_status.is_empty() {
        default_expected_status
    } else {
        &target.expected_status
    };
    if !expected.contains(&(status as i32)) {
        let err = ProbeError::WrongStatus { got: status };
        result.success = false;
        result.error_kind = Some(err.kind().to_string());
        result.error_message = Some(err.to_string());
        return Ok(result);
    }

    if let Some(expected) = &target.expected_content {
        if !String::from_utf8_lossy(&body).contains(expected.as_str()) {
            let err = ProbeError::ContentMismatch;
            result.success = false;
            result.error_kind = Some(err.kind().to_string());
            result.error_message = Some(err.to_string());
            return Ok(result);
        }
    }

    Ok(result)
}

fn capture_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Map a reqwest error onto the probe taxonomy. TLS verification failures
/// must come out non-transient so the retry loop leaves them alone.
fn classify(err: reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return if err.is_connect() {
            ProbeError::ConnectTimeout(timeout)
        } else {
            ProbeError::ReadTimeout(timeout)
        };
    }
    let detail = source_chain(&err);
    let lowered = detail.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
        ProbeError::TlsVerify(detail)
    } else if err.is_connect() && lowered.contains("refused") {
        ProbeError::ConnectRefused
    } else {
        ProbeError::Network(detail)
    }
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}
