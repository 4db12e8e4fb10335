//! types.rs — Data model for the uptime monitoring service
//!
//! Faithful, idiomatic representation of the PostgreSQL schema.
//! Enums map to Postgres enum types via `postgres-types` derives; row
//! structs convert from `tokio_postgres::Row` at the storage boundary.

use chrono::{DateTime, NaiveDate, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_postgres::Row;
use uuid::Uuid;

/// Account role (PostgreSQL enum `user_role`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSql, FromSql)]
#[postgres(name = "user_role", rename_all = "lowercase")]
pub enum UserRole {
    Member,
    Admin,
    Owner,
}

/// Account lifecycle status (PostgreSQL enum `user_status`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSql, FromSql)]
#[postgres(name = "user_status", rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Banned,
}

/// Probe kind for a monitored target (PostgreSQL enum `target_kind`).
///
/// `Http` and `Https` share one probe implementation and differ only in
/// default port and whether TLS metadata can be captured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSql, FromSql)]
#[postgres(name = "target_kind", rename_all = "lowercase")]
pub enum TargetKind {
    Http,
    Https,
    Tcp,
    Dns,
    Tls,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http => "http",
            TargetKind::Https => "https",
            TargetKind::Tcp => "tcp",
            TargetKind::Dns => "dns",
            TargetKind::Tls => "tls",
        }
    }

    /// Kinds whose probes refresh TLS certificate metadata.
    pub fn carries_tls(&self) -> bool {
        matches!(self, TargetKind::Https | TargetKind::Tls)
    }
}

/// Notification kind (PostgreSQL enum `alert_kind`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSql, FromSql)]
#[postgres(name = "alert_kind", rename_all = "snake_case")]
pub enum AlertKind {
    Down,
    Up,
    Slow,
    TlsExpiry,
    Maintenance,
    Error,
    Warning,
}

/// Registered account (`users`).
///
/// `id` is the external account id handed to us by the chat surface;
/// `chat_id` is the routing identifier the sink delivers to. They usually
/// coincide but are resolved separately at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub role: UserRole,
    pub status: UserStatus,
    pub max_targets: i32,
    pub min_interval_secs: i32,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl From<Row> for User {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            chat_id: row.get("chat_id"),
            username: row.get("username"),
            role: row.get("role"),
            status: row.get("status"),
            max_targets: row.get("max_targets"),
            min_interval_secs: row.get("min_interval_secs"),
            last_active_at: row.get("last_active_at"),
            created_at: row.try_get("created_at").ok(),
            deleted: row.get("deleted"),
        }
    }
}

/// Monitored endpoint (`targets`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub uuid: Uuid,
    pub owner_id: i64,
    pub name: String,
    pub url: String,
    pub kind: TargetKind,
    pub method: String,
    pub interval_secs: i32,
    pub timeout_secs: i32,
    pub retry_count: i32,
    pub retry_delay_secs: i32,
    pub expected_status: Vec<i32>,
    pub expected_content: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub slow_threshold_secs: f64,
    pub alert_on_down: bool,
    pub alert_on_recovery: bool,
    pub alert_on_slow: bool,
    pub dns_record_type: Option<String>,

    // Current state
    pub is_active: bool,
    pub is_up: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub last_response_time: Option<f64>,

    // Aggregates
    pub total_probes: i64,
    pub successful_probes: i64,
    pub failed_probes: i64,
    pub uptime_percent: f64,
    pub min_response_time: Option<f64>,
    pub avg_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub total_downtime_secs: i64,
    pub downtime_events: i64,
    pub current_downtime_start: Option<DateTime<Utc>>,

    // TLS metadata
    pub tls_expiry: Option<DateTime<Utc>>,
    pub tls_issuer: Option<String>,
    pub tls_days_remaining: Option<i32>,

    pub deleted: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Row> for Target {
    fn from(row: Row) -> Self {
        let headers: serde_json::Value = row.get("headers");
        Self {
            id: row.get("id"),
            uuid: row.get("uuid"),
            owner_id: row.get("owner_id"),
            name: row.get("name"),
            url: row.get("url"),
            kind: row.get("kind"),
            method: row.get("method"),
            interval_secs: row.get("interval_secs"),
            timeout_secs: row.get("timeout_secs"),
            retry_count: row.get("retry_count"),
            retry_delay_secs: row.get("retry_delay_secs"),
            expected_status: row.get("expected_status"),
            expected_content: row.get("expected_content"),
            headers: serde_json::from_value(headers).unwrap_or_default(),
            body: row.get("body"),
            slow_threshold_secs: row.get("slow_threshold_secs"),
            alert_on_down: row.get("alert_on_down"),
            alert_on_recovery: row.get("alert_on_recovery"),
            alert_on_slow: row.get("alert_on_slow"),
            dns_record_type: row.get("dns_record_type"),
            is_active: row.get("is_active"),
            is_up: row.get("is_up"),
            last_probe_at: row.get("last_probe_at"),
            next_due_at: row.get("next_due_at"),
            last_status_code: row.get("last_status_code"),
            last_response_time: row.get("last_response_time"),
            total_probes: row.get("total_probes"),
            successful_probes: row.get("successful_probes"),
            failed_probes: row.get("failed_probes"),
            uptime_percent: row.get("uptime_percent"),
            min_response_time: row.get("min_response_time"),
            avg_response_time: row.get("avg_response_time"),
            max_response_time: row.get("max_response_time"),
            total_downtime_secs: row.get("total_downtime_secs"),
            downtime_events: row.get("downtime_events"),
            current_downtime_start: row.get("current_downtime_start"),
            tls_expiry: row.get("tls_expiry"),
            tls_issuer: row.get("tls_issuer"),
            tls_days_remaining: row.get("tls_days_remaining"),
            deleted: row.get("deleted"),
            created_at: row.try_get("created_at").ok(),
        }
    }
}

/// Append-only record of one probe (`probe_logs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeLog {
    pub id: i64,
    pub target_id: i64,
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub status_code: Option<i32>,
    pub response_time: Option<f64>,
    pub response_size: Option<i64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub dns_time: Option<f64>,
    pub connect_time: Option<f64>,
    pub resolved_ip: Option<String>,
    pub tls_verified: Option<bool>,
    pub retries_used: i32,
    pub headers: Option<serde_json::Value>,
}

impl From<Row> for ProbeLog {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            target_id: row.get("target_id"),
            checked_at: row.get("checked_at"),
            success: row.get("success"),
            status_code: row.get("status_code"),
            response_time: row.get("response_time"),
            response_size: row.get("response_size"),
            error_kind: row.get("error_kind"),
            error_message: row.get("error_message"),
            dns_time: row.get("dns_time"),
            connect_time: row.get("connect_time"),
            resolved_ip: row.get("resolved_ip"),
            tls_verified: row.get("tls_verified"),
            retries_used: row.get("retries_used"),
            headers: row.get("headers"),
        }
    }
}

/// Probe-log values not yet assigned an id by the database.
#[derive(Debug, Clone, Default)]
pub struct NewProbeLog {
    pub target_id: i64,
    pub checked_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub status_code: Option<i32>,
    pub response_time: Option<f64>,
    pub response_size: Option<i64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub dns_time: Option<f64>,
    pub connect_time: Option<f64>,
    pub resolved_ip: Option<String>,
    pub tls_verified: Option<bool>,
    pub retries_used: i32,
    pub headers: Option<serde_json::Value>,
}

/// Computed next state of a target after one probe cycle.
///
/// Produced by the recorder's pure state math and applied by storage in a
/// single `UPDATE`, so readers never observe a partial probe update. TLS
/// fields are `None` when the probe carried no certificate metadata, in
/// which case the stored values are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetUpdate {
    pub target_id: i64,
    pub is_up: bool,
    pub last_probe_at: DateTime<Utc>,
    pub next_due_at: DateTime<Utc>,
    pub last_status_code: Option<i32>,
    pub last_response_time: Option<f64>,
    pub total_probes: i64,
    pub successful_probes: i64,
    pub failed_probes: i64,
    pub uptime_percent: f64,
    pub min_response_time: Option<f64>,
    pub avg_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub total_downtime_secs: i64,
    pub downtime_events: i64,
    pub current_downtime_start: Option<DateTime<Utc>>,
    pub tls_expiry: Option<DateTime<Utc>>,
    pub tls_issuer: Option<String>,
    pub tls_days_remaining: Option<i32>,
}

/// Alert values not yet assigned an id by the database.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub owner_id: i64,
    pub target_id: Option<i64>,
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
    pub priority: i16,
    pub channels: Vec<String>,
    pub sent: bool,
    pub max_retries: i32,
}

/// Persisted notification record (`alerts`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub owner_id: i64,
    pub target_id: Option<i64>,
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
    pub priority: i16,
    pub channels: Vec<String>,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub retries: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl From<Row> for Alert {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            target_id: row.get("target_id"),
            kind: row.get("kind"),
            title: row.get("title"),
            body: row.get("body"),
            priority: row.get("priority"),
            channels: row.get("channels"),
            sent: row.get("sent"),
            sent_at: row.get("sent_at"),
            retries: row.get("retries"),
            max_retries: row.get("max_retries"),
            created_at: row.get("created_at"),
        }
    }
}

/// One row per UTC calendar day (`daily_stats`), upserted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_users: i64,
    pub active_users: i64,
    pub total_targets: i64,
    pub active_targets: i64,
    pub total_probes: i64,
    pub successful_probes: i64,
    pub failed_probes: i64,
    pub avg_response_time: Option<f64>,
    pub total_downtime_secs: i64,
}

impl From<Row> for DailyStats {
    fn from(row: Row) -> Self {
        Self {
            date: row.get("date"),
            total_users: row.get("total_users"),
            active_users: row.get("active_users"),
            total_targets: row.get("total_targets"),
            active_targets: row.get("active_targets"),
            total_probes: row.get("total_probes"),
            successful_probes: row.get("successful_probes"),
            failed_probes: row.get("failed_probes"),
            avg_response_time: row.get("avg_response_time"),
            total_downtime_secs: row.get("total_downtime_secs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_kind_tls_capture() {
        assert!(TargetKind::Https.carries_tls());
        assert!(TargetKind::Tls.carries_tls());
        assert!(!TargetKind::Http.carries_tls());
        assert!(!TargetKind::Tcp.carries_tls());
        assert!(!TargetKind::Dns.carries_tls());
    }

    #[test]
    fn target_kind_names() {
        assert_eq!(TargetKind::Https.as_str(), "https");
        assert_eq!(TargetKind::Dns.as_str(), "dns");
    }
}
