//! transition.rs — Turns a probe outcome into zero or more alert intents.
//!
//! Purely functional over the target's pre-probe state, so the engine calls
//! it with the target as selected (before the recorder's update) and the
//! fresh probe result. A single probe can emit several intents, e.g. a
//! successful but slow response on a certificate that is about to expire.

use crate::probe::ProbeResult;
use crate::types::{AlertKind, Target};
use chrono::{DateTime, Utc};

/// In-memory description of an alert to be dispatched.
#[derive(Debug, Clone)]
pub struct AlertIntent {
    pub owner_id: i64,
    pub target_id: i64,
    pub target_name: String,
    pub target_url: String,
    pub kind: AlertKind,
    pub error_message: Option<String>,
    pub response_time: Option<f64>,
    pub downtime_secs: Option<i64>,
    pub tls_days_remaining: Option<i32>,
}

impl AlertIntent {
    fn new(target: &Target, kind: AlertKind) -> Self {
        Self {
            owner_id: target.owner_id,
            target_id: target.id,
            target_name: target.name.clone(),
            target_url: target.url.clone(),
            kind,
            error_message: None,
            response_time: None,
            downtime_secs: None,
            tls_days_remaining: None,
        }
    }
}

/// Detect UP↔DOWN transitions and threshold crossings.
///
/// `target` carries the state from before the probe ran; `target.is_up` is
/// the old up/down flag and `current_downtime_start` the open window, if any.
pub fn detect(
    target: &Target,
    result: &ProbeResult,
    now: DateTime<Utc>,
    tls_warning_days: i32,
) -> Vec<AlertIntent> {
    let mut intents = Vec::new();

    if target.is_up && !result.success && target.alert_on_down {
        let mut intent = AlertIntent::new(target, AlertKind::Down);
        intent.error_message = result.error_message.clone();
        intents.push(intent);
    }

    if !target.is_up && result.success && target.alert_on_recovery {
        let mut intent = AlertIntent::new(target, AlertKind::Up);
        intent.downtime_secs = target
            .current_downtime_start
            .map(|started| (now - started).num_seconds().max(0));
        intents.push(intent);
    }

    if result.success && target.alert_on_slow {
        if let Some(rt) = result.response_time {
            if rt > target.slow_threshold_secs {
                let mut intent = AlertIntent::new(target, AlertKind::Slow);
                intent.response_time = Some(rt);
                intents.push(intent);
            }
        }
    }

    if let Some(tls) = &result.tls {
        if tls.days_remaining <= tls_warning_days {
            let mut intent = AlertIntent::new(target, AlertKind::TlsExpiry);
            intent.tls_days_remaining = Some(tls.days_remaining);
            intents.push(intent);
        }
    }

    intents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::probe::TlsInfo;
    use crate::types::TargetKind;
    use chrono::Duration;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn target(is_up: bool) -> Target {
        Target {
            id: 7,
            uuid: Uuid::new_v4(),
            owner_id: 42,
            name: "example".into(),
            url: "https://example.com".into(),
            kind: TargetKind::Https,
            method: "GET".into(),
            interval_secs: 60,
            timeout_secs: 30,
            retry_count: 0,
            retry_delay_secs: 1,
            expected_status: vec![200],
            expected_content: None,
            headers: HashMap::new(),
            body: None,
            slow_threshold_secs: 5.0,
            alert_on_down: true,
            alert_on_recovery: true,
            alert_on_slow: true,
            dns_record_type: None,
            is_active: true,
            is_up,
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

    fn tls_result(days_remaining: i32) -> ProbeResult {
        let now = Utc::now();
        let mut result = ProbeResult::ok(0.1);
        result.tls = Some(TlsInfo {
            issuer: None,
            subject: None,
            not_before: now - Duration::days(30),
            not_after: now + Duration::days(i64::from(days_remaining)),
            days_remaining,
        });
        result
    }

    #[test]
    fn up_to_down_emits_exactly_one_down() {
        let failure = ProbeResult::from_error(&ProbeError::ConnectRefused, 0);
        let intents = detect(&target(true), &failure, Utc::now(), 30);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, AlertKind::Down);
        assert!(intents[0].error_message.is_some());
    }

    #[test]
    fn down_to_up_carries_downtime_duration() {
        let now = Utc::now();
        let mut t = target(false);
        t.current_downtime_start = Some(now - Duration::seconds(180));
        let intents = detect(&t, &ProbeResult::ok(0.3), now, 30);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, AlertKind::Up);
        assert_eq!(intents[0].downtime_secs, Some(180));
    }

    #[test]
    fn steady_states_emit_nothing() {
        assert!(detect(&target(true), &ProbeResult::ok(0.1), Utc::now(), 30).is_empty());
        let failure = ProbeResult::from_error(&ProbeError::ConnectRefused, 0);
        assert!(detect(&target(false), &failure, Utc::now(), 30).is_empty());
    }

    #[test]
    fn disabled_flags_suppress_intents() {
        let mut t = target(true);
        t.alert_on_down = false;
        let failure = ProbeResult::from_error(&ProbeError::ConnectRefused, 0);
        assert!(detect(&t, &failure, Utc::now(), 30).is_empty());

        let mut t = target(false);
        t.alert_on_recovery = false;
        assert!(detect(&t, &ProbeResult::ok(0.1), Utc::now(), 30).is_empty());
    }

    #[test]
    fn slow_response_over_threshold() {
        let intents = detect(&target(true), &ProbeResult::ok(6.5), Utc::now(), 30);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, AlertKind::Slow);
        assert_eq!(intents[0].response_time, Some(6.5));

        // At the threshold is not slow.
        assert!(detect(&target(true), &ProbeResult::ok(5.0), Utc::now(), 30).is_empty());
    }

    #[test]
    fn tls_expiry_boundary_is_inclusive() {
        let at_threshold = detect(&target(true), &tls_result(30), Utc::now(), 30);
        assert_eq!(at_threshold.len(), 1);
        assert_eq!(at_threshold[0].kind, AlertKind::TlsExpiry);
        assert_eq!(at_threshold[0].tls_days_remaining, Some(30));

        let above_threshold = detect(&target(true), &tls_result(31), Utc::now(), 30);
        assert!(above_threshold.is_empty());
    }

    #[test]
    fn slow_and_tls_expiry_can_both_fire() {
        let mut result = tls_result(7);
        result.response_time = Some(9.0);
        let intents = detect(&target(true), &result, Utc::now(), 30);
        let kinds: Vec<AlertKind> = intents.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&AlertKind::Slow));
        assert!(kinds.contains(&AlertKind::TlsExpiry));
        assert_eq!(intents.len(), 2);
    }
}
