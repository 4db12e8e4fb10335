//! TCP probe: a timed connect against `host:port` (port 80 when absent).
//! The connection is dropped immediately; only the connect latency matters.

use super::{ProbeResult, host_port};
use crate::error::ProbeError;
use crate::types::Target;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

pub(super) async fn check(target: &Target, timeout: Duration) -> Result<ProbeResult, ProbeError> {
    let (host, port) = host_port(&target.url, 80)?;
    let addr = format!("{host}:{port}");

    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => {
            let elapsed = started.elapsed().as_secs_f64();
            let mut result = ProbeResult::ok(elapsed);
            result.connect_time = Some(elapsed);
            Ok(result)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(ProbeError::ConnectRefused)
        }
        Ok(Err(e)) => Err(ProbeError::Network(e.to_string())),
        Err(_) => Err(ProbeError::ConnectTimeout(timeout)),
    }
}
