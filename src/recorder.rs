//! recorder.rs — Applies one probe result to a target's persisted state.
//!
//! `apply` is pure: it computes the probe-log row and the target's next
//! state from the previous state and the result. `record` persists both in
//! a single transaction, so the recorder is the sole writer of target state
//! during a cycle and partial updates are never visible.

use crate::probe::ProbeResult;
use crate::storage::Storage;
use crate::types::{NewProbeLog, Target, TargetUpdate};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

/// Compute the probe-log row and the target state that follows `result`.
pub fn apply(
    target: &Target,
    result: &ProbeResult,
    now: DateTime<Utc>,
) -> (TargetUpdate, NewProbeLog) {
    let total = target.total_probes + 1;
    let mut successful = target.successful_probes;
    let mut failed = target.failed_probes;
    let mut total_downtime = target.total_downtime_secs;
    let mut downtime_events = target.downtime_events;
    let mut downtime_start = target.current_downtime_start;

    if result.success {
        successful += 1;
        if !target.is_up {
            if let Some(started) = downtime_start {
                total_downtime += (now - started).num_seconds().max(0);
            }
            downtime_start = None;
        }
    } else {
        failed += 1;
        if target.is_up {
            downtime_start = Some(now);
            downtime_events += 1;
        }
    }

    let uptime_percent = if total > 0 {
        100.0 * successful as f64 / total as f64
    } else {
        100.0
    };

    let mut min_rt = target.min_response_time;
    let mut avg_rt = target.avg_response_time;
    let mut max_rt = target.max_response_time;
    if result.success {
        if let Some(rt) = result.response_time {
            min_rt = Some(min_rt.map_or(rt, |m| m.min(rt)));
            max_rt = Some(max_rt.map_or(rt, |m| m.max(rt)));
            // Running mean over successful probes, which are exactly the
            // samples that carry a response time.
            avg_rt = Some(match avg_rt {
                Some(avg) => avg + (rt - avg) / successful as f64,
                None => rt,
            });
        }
    }

    let update = TargetUpdate {
        target_id: target.id,
        is_up: result.success,
        last_probe_at: now,
        next_due_at: now + Duration::seconds(i64::from(target.interval_secs)),
        last_status_code: result.status_code,
        last_response_time: result.response_time,
        total_probes: total,
        successful_probes: successful,
        failed_probes: failed,
        uptime_percent,
        min_response_time: min_rt,
        avg_response_time: avg_rt,
        max_response_time: max_rt,
        total_downtime_secs: total_downtime,
        downtime_events,
        current_downtime_start: downtime_start,
        tls_expiry: result.tls.as_ref().map(|t| t.not_after),
        tls_issuer: result.tls.as_ref().and_then(|t| t.issuer.clone()),
        tls_days_remaining: result.tls.as_ref().map(|t| t.days_remaining),
    };

    let log = NewProbeLog {
        target_id: target.id,
        checked_at: Some(now),
        success: result.success,
        status_code: result.status_code,
        response_time: result.response_time,
        response_size: result.response_size,
        error_kind: result.error_kind.clone(),
        error_message: result.error_message.clone(),
        dns_time: result.dns_time,
        connect_time: result.connect_time,
        resolved_ip: result.resolved_ip.clone(),
        tls_verified: result.tls_verified,
        retries_used: result.retries_used,
        headers: if result.headers.is_empty() {
            None
        } else {
            serde_json::to_value(&result.headers).ok()
        },
    };

    (update, log)
}

/// Persist one probe cycle and return the state that was written.
pub async fn record(
    storage: &Storage,
    target: &Target,
    result: &ProbeResult,
    now: DateTime<Utc>,
) -> Result<TargetUpdate> {
    let (update, log) = apply(target, result, now);
    storage.record_probe(&log, &update).await?;
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TlsInfo;
    use crate::types::TargetKind;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn target() -> Target {
        Target {
            id: 1,
            uuid: Uuid::new_v4(),
            owner_id: 42,
            name: "example".into(),
            url: "https://example.com".into(),
            kind: TargetKind::Https,
            method: "GET".into(),
            interval_secs: 60,
            timeout_secs: 30,
            retry_count: 2,
            retry_delay_secs: 2,
            expected_status: vec![200],
            expected_content: None,
            headers: HashMap::new(),
            body: None,
            slow_threshold_secs: 5.0,
            alert_on_down: true,
            alert_on_recovery: true,
            alert_on_slow: false,
            dns_record_type: None,
            is_active: true,
            is_up: true,
            last_probe_at: None,
            next_due_at: None,
            last_status_code: None,
            last_response_time: None,
            total_probes: 0,
            successful_probes: 0,
            failed_probes: 0,
            uptime_percent: 100.0,
            min_response_time: None,
            avg_response_time: None,
            max_response_time: None,
            total_downtime_secs: 0,
            downtime_events: 0,
            current_downtime_start: None,
            tls_expiry: None,
            tls_issuer: None,
            tls_days_remaining: None,
            deleted: false,
            created_at: None,
        }
    }

    fn success(rt: f64) -> ProbeResult {
        let mut result = ProbeResult::ok(rt);
        result.status_code = Some(200);
        result
    }

    fn failure() -> ProbeResult {
        ProbeResult::from_error(&crate::error::ProbeError::ConnectRefused, 0)
    }

    #[test]
    fn healthy_probe_updates_counters_and_due_time() {
        let t = target();
        let now = Utc::now();
        let (update, log) = apply(&t, &success(0.12), now);

        assert_eq!(update.total_probes, 1);
        assert_eq!(update.successful_probes, 1);
        assert_eq!(update.failed_probes, 0);
        assert!((update.uptime_percent - 100.0).abs() < 0.01);
        assert!(update.is_up);
        assert_eq!(update.next_due_at, now + Duration::seconds(60));
        assert!(update.current_downtime_start.is_none());
        assert_eq!(update.last_status_code, Some(200));
        assert!(log.success);
        assert_eq!(log.status_code, Some(200));
        assert_eq!(log.response_time, Some(0.12));
    }

    #[test]
    fn failure_opens_downtime_window() {
        let t = target();
        let now = Utc::now();
        let (update, _) = apply(&t, &failure(), now);

        assert_eq!(update.total_probes, 1);
        assert_eq!(update.failed_probes, 1);
        assert!(!update.is_up);
        assert_eq!(update.current_downtime_start, Some(now));
        assert_eq!(update.downtime_events, 1);
        assert_eq!(update.uptime_percent, 0.0);
    }

    #[test]
    fn recovery_closes_downtime_and_accounts_duration() {
        let mut t = target();
        let went_down = Utc::now();
        t.is_up = false;
        t.current_downtime_start = Some(went_down);
        t.total_probes = 3;
        t.successful_probes = 2;
        t.failed_probes = 1;
        t.downtime_events = 1;

        let now = went_down + Duration::seconds(180);
        let (update, _) = apply(&t, &success(0.3), now);

        assert!(update.is_up);
        assert!(update.current_downtime_start.is_none());
        assert_eq!(update.total_downtime_secs, 180);
        assert_eq!(update.downtime_events, 1);
        assert_eq!(update.total_probes, 4);
        assert_eq!(update.successful_probes, 3);
    }

    #[test]
    fn repeated_failure_keeps_original_downtime_start() {
        let mut t = target();
        let went_down = Utc::now() - Duration::seconds(120);
        t.is_up = false;
        t.current_downtime_start = Some(went_down);
        t.total_probes = 1;
        t.failed_probes = 1;
        t.downtime_events = 1;

        let (update, _) = apply(&t, &failure(), Utc::now());
        assert_eq!(update.current_downtime_start, Some(went_down));
        assert_eq!(update.downtime_events, 1);
    }

    #[test]
    fn response_time_folding_running_mean() {
        let mut t = target();
        let now = Utc::now();

        let (first, _) = apply(&t, &success(0.2), now);
        assert_eq!(first.min_response_time, Some(0.2));
        assert_eq!(first.avg_response_time, Some(0.2));
        assert_eq!(first.max_response_time, Some(0.2));

        t.total_probes = first.total_probes;
        t.successful_probes = first.successful_probes;
        t.min_response_time = first.min_response_time;
        t.avg_response_time = first.avg_response_time;
        t.max_response_time = first.max_response_time;

        let (second, _) = apply(&t, &success(0.4), now);
        assert_eq!(second.min_response_time, Some(0.2));
        assert_eq!(second.max_response_time, Some(0.4));
        assert!((second.avg_response_time.unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn failed_probe_does_not_fold_response_time() {
        let mut t = target();
        t.min_response_time = Some(0.2);
        t.avg_response_time = Some(0.2);
        t.max_response_time = Some(0.2);
        t.total_probes = 1;
        t.successful_probes = 1;

        let (update, _) = apply(&t, &failure(), Utc::now());
        assert_eq!(update.min_response_time, Some(0.2));
        assert_eq!(update.avg_response_time, Some(0.2));
        assert_eq!(update.max_response_time, Some(0.2));
    }

    #[test]
    fn tls_metadata_is_copied_onto_the_target() {
        let t = target();
        let now = Utc::now();
        let mut result = success(0.5);
        result.tls = Some(TlsInfo {
            issuer: Some("R11".into()),
            subject: Some("example.com".into()),
            not_before: now - Duration::days(10),
            not_after: now + Duration::days(7),
            days_remaining: 7,
        });

        let (update, _) = apply(&t, &result, now);
        assert_eq!(update.tls_days_remaining, Some(7));
        assert_eq!(update.tls_issuer.as_deref(), Some("R11"));
        assert_eq!(update.tls_expiry, Some(now + Duration::days(7)));
    }

    #[test]
    fn counter_invariants_hold_across_mixed_history() {
        let mut t = target();
        let mut now = Utc::now();
        for i in 0..20 {
            let result = if i % 3 == 0 { failure() } else { success(0.1) };
            let (update, _) = apply(&t, &result, now);

            assert_eq!(
                update.total_probes,
                update.successful_probes + update.failed_probes
            );
            assert!(update.uptime_percent >= 0.0 && update.uptime_percent <= 100.0);
            assert_eq!(update.is_up, update.current_downtime_start.is_none());
            assert!(update.total_probes >= t.total_probes);
            assert!(update.total_downtime_secs >= t.total_downtime_secs);
            assert!(update.next_due_at > update.last_probe_at);

            t.is_up = update.is_up;
            t.total_probes = update.total_probes;
            t.successful_probes = update.successful_probes;
            t.failed_probes = update.failed_probes;
            t.total_downtime_secs = update.total_downtime_secs;
            t.downtime_events = update.downtime_events;
            t.current_downtime_start = update.current_downtime_start;
            now += Duration::seconds(60);
        }
    }
}
