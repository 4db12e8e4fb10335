//! DNS probe: resolves the target host for its configured record type
//! (A when unset) and reports resolution latency plus the first answer.
//! NXDOMAIN, an empty answer and a lookup timeout are distinct failures;
//! only the timeout is retried.

use super::{ProbeResult, host_of};
use crate::error::ProbeError;
use crate::types::Target;
use std::time::{Duration, Instant};
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::proto::rr::RecordType;

pub(super) async fn check(
    resolver: &TokioAsyncResolver,
    target: &Target,
    timeout: Duration,
) -> Result<ProbeResult, ProbeError> {
    let host = host_of(&target.url)?;
    let record_type = record_type_of(target.dns_record_type.as_deref())?;

    let started = Instant::now();
    let lookup = tokio::time::timeout(timeout, resolver.lookup(host.as_str(), record_type)).await;
    let elapsed = started.elapsed().as_secs_f64();

    match lookup {
        Ok(Ok(answer)) => {
            let first = answer.iter().next().map(|record| record.to_string());
            match first {
                Some(value) => {
                    let mut result = ProbeResult::ok(elapsed);
                    result.dns_time = Some(elapsed);
                    result.resolved_ip = Some(value);
                    Ok(result)
                }
                None => Err(ProbeError::NoAnswer(record_type.to_string())),
            }
        }
        Ok(Err(e)) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. }
                if *response_code == ResponseCode::NXDomain =>
            {
                Err(ProbeError::NxDomain)
            }
            ResolveErrorKind::NoRecordsFound { .. } => {
                Err(ProbeError::NoAnswer(record_type.to_string()))
            }
            ResolveErrorKind::Timeout => Err(ProbeError::DnsTimeout),
            _ => Err(ProbeError::Network(e.to_string())),
        },
        Err(_) => Err(ProbeError::DnsTimeout),
    }
}

fn record_type_of(configured: Option<&str>) -> Result<RecordType, ProbeError> {
    let name = configured.unwrap_or("A").trim().to_uppercase();
    match name.as_str() {
        "A" => Ok(RecordType::A),
        "AAAA" => Ok(RecordType::AAAA),
        "CNAME" => Ok(RecordType::CNAME),
        "MX" => Ok(RecordType::MX),
        "NS" => Ok(RecordType::NS),
        "TXT" => Ok(RecordType::TXT),
        "SOA" => Ok(RecordType::SOA),
        "PTR" => Ok(RecordType::PTR),
        "SRV" => Ok(RecordType::SRV),
        "CAA" => Ok(RecordType::CAA),
        other => Err(ProbeError::InvalidUrl(format!(
            "unsupported dns record type {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_defaults_to_a() {
        assert_eq!(record_type_of(None).unwrap(), RecordType::A);
        assert_eq!(record_type_of(Some("aaaa")).unwrap(), RecordType::AAAA);
        assert_eq!(record_type_of(Some(" mx ")).unwrap(), RecordType::MX);
        assert!(record_type_of(Some("BOGUS")).is_err());
    }
}
