use crate::config::DatabaseSettings;
use crate::types::{DailyStats, NewAlert, NewProbeLog, Target, TargetUpdate, User, UserStatus};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;

/// Storage: persistence layer over a pooled PostgreSQL connection.
///
/// All methods are async and return `Result<T>`. Connections are checked
/// out per call from a deadpool pool with verified recycling, so a stale
/// connection is re-validated before reuse. No long-lived transactions are
/// held; the recorder's per-cycle transaction is the longest-lived one.
pub struct Storage {
    pool: Pool,
}

const SCHEMA: &str = r#"
DO $$ BEGIN
    CREATE TYPE user_role AS ENUM ('member', 'admin', 'owner');
EXCEPTION WHEN duplicate_object THEN NULL; END $$;

DO $$ BEGIN
    CREATE TYPE user_status AS ENUM ('active', 'inactive', 'suspended', 'banned');
EXCEPTION WHEN duplicate_object THEN NULL; END $$;

DO $$ BEGIN
    CREATE TYPE target_kind AS ENUM ('http', 'https', 'tcp', 'dns', 'tls');
EXCEPTION WHEN duplicate_object THEN NULL; END $$;

DO $$ BEGIN
    CREATE TYPE alert_kind AS ENUM
        ('down', 'up', 'slow', 'tls_expiry', 'maintenance', 'error', 'warning');
EXCEPTION WHEN duplicate_object THEN NULL; END $$;

CREATE TABLE IF NOT EXISTS users (
    id                BIGINT PRIMARY KEY,
    chat_id           BIGINT NOT NULL,
    username          TEXT,
    role              user_role NOT NULL DEFAULT 'member',
    status            user_status NOT NULL DEFAULT 'active',
    max_targets       INT NOT NULL DEFAULT 10,
    min_interval_secs INT NOT NULL DEFAULT 60,
    last_active_at    TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deleted           BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS targets (
    id                     BIGSERIAL PRIMARY KEY,
    uuid                   UUID NOT NULL UNIQUE,
    owner_id               BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    name                   TEXT NOT NULL,
    url                    TEXT NOT NULL,
    kind                   target_kind NOT NULL,
    method                 TEXT NOT NULL DEFAULT 'GET',
    interval_secs          INT NOT NULL DEFAULT 300,
    timeout_secs           INT NOT NULL DEFAULT 30,
    retry_count            INT NOT NULL DEFAULT 2,
    retry_delay_secs       INT NOT NULL DEFAULT 2,
    expected_status        INT[] NOT NULL DEFAULT '{200}',
    expected_content       TEXT,
    headers                JSONB NOT NULL DEFAULT '{}',
    body                   TEXT,
    slow_threshold_secs    DOUBLE PRECISION NOT NULL DEFAULT 5.0,
    alert_on_down          BOOLEAN NOT NULL DEFAULT TRUE,
    alert_on_recovery      BOOLEAN NOT NULL DEFAULT TRUE,
    alert_on_slow          BOOLEAN NOT NULL DEFAULT FALSE,
    dns_record_type        TEXT,
    is_active              BOOLEAN NOT NULL DEFAULT TRUE,
    is_up                  BOOLEAN NOT NULL DEFAULT TRUE,
    last_probe_at          TIMESTAMPTZ,
    next_due_at            TIMESTAMPTZ,
    last_status_code       INT,
    last_response_time     DOUBLE PRECISION,
    total_probes           BIGINT NOT NULL DEFAULT 0,
    successful_probes      BIGINT NOT NULL DEFAULT 0,
    failed_probes          BIGINT NOT NULL DEFAULT 0,
    uptime_percent         DOUBLE PRECISION NOT NULL DEFAULT 100.0,
    min_response_time      DOUBLE PRECISION,
    avg_response_time      DOUBLE PRECISION,
    max_response_time      DOUBLE PRECISION,
    total_downtime_secs    BIGINT NOT NULL DEFAULT 0,
    downtime_events        BIGINT NOT NULL DEFAULT 0,
    current_downtime_start TIMESTAMPTZ,
    tls_expiry             TIMESTAMPTZ,
    tls_issuer             TEXT,
    tls_days_remaining     INT,
    deleted                BOOLEAN NOT NULL DEFAULT FALSE,
    created_at             TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_targets_due
    ON targets (is_active, next_due_at);

CREATE TABLE IF NOT EXISTS probe_logs (
    id            BIGSERIAL PRIMARY KEY,
    target_id     BIGINT NOT NULL REFERENCES targets (id) ON DELETE CASCADE,
    checked_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    success       BOOLEAN NOT NULL,
    status_code   INT,
    response_time DOUBLE PRECISION,
    response_size BIGINT,
    error_kind    TEXT,
    error_message TEXT,
    dns_time      DOUBLE PRECISION,
    connect_time  DOUBLE PRECISION,
    resolved_ip   TEXT,
    tls_verified  BOOLEAN,
    retries_used  INT NOT NULL DEFAULT 0,
    headers       JSONB
);

CREATE INDEX IF NOT EXISTS idx_probe_logs_target_time
    ON probe_logs (target_id, checked_at);

CREATE TABLE IF NOT EXISTS alerts (
    id          BIGSERIAL PRIMARY KEY,
    owner_id    BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    target_id   BIGINT REFERENCES targets (id) ON DELETE CASCADE,
    kind        alert_kind NOT NULL,
    title       TEXT NOT NULL,
    body        TEXT NOT NULL,
    priority    SMALLINT NOT NULL DEFAULT 0,
    channels    TEXT[] NOT NULL DEFAULT '{telegram}',
    sent        BOOLEAN NOT NULL DEFAULT FALSE,
    sent_at     TIMESTAMPTZ,
    retries     INT NOT NULL DEFAULT 0,
    max_retries INT NOT NULL DEFAULT 3,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_alerts_owner_sent
    ON alerts (owner_id, sent);

CREATE TABLE IF NOT EXISTS activity_logs (
    id         BIGSERIAL PRIMARY KEY,
    user_id    BIGINT NOT NULL,
    action     TEXT NOT NULL,
    detail     TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS daily_stats (
    date                DATE PRIMARY KEY,
    total_users         BIGINT NOT NULL DEFAULT 0,
    active_users        BIGINT NOT NULL DEFAULT 0,
    total_targets       BIGINT NOT NULL DEFAULT 0,
    active_targets      BIGINT NOT NULL DEFAULT 0,
    total_probes        BIGINT NOT NULL DEFAULT 0,
    successful_probes   BIGINT NOT NULL DEFAULT 0,
    failed_probes       BIGINT NOT NULL DEFAULT 0,
    avg_response_time   DOUBLE PRECISION,
    total_downtime_secs BIGINT NOT NULL DEFAULT 0
);
"#;

impl Storage {
    /// Open a connection pool against the configured PostgreSQL database.
    pub async fn connect(db: &DatabaseSettings) -> Result<Self> {
        let pg_config: tokio_postgres::Config = db.url.parse()?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Verified,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(db.pool_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(Duration::from_secs(db.pool_timeout_secs)))
            .create_timeout(Some(Duration::from_secs(db.pool_timeout_secs)))
            .recycle_timeout(Some(Duration::from_secs(db.pool_recycle_secs)))
            .build()?;
        Ok(Self { pool })
    }

    /// Create enum types, tables and indexes when missing.
    pub async fn init_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }

    /// Cheap round-trip used by the heartbeat job.
    pub async fn health_check(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Atomically claim up to `limit` due targets.
    ///
    /// Selection runs `FOR UPDATE SKIP LOCKED` and sets a provisional
    /// `next_due_at = now + interval` inside the same transaction, so two
    /// concurrent sweeps never hand out the same target and a crashed probe
    /// cycle retries one interval later. The recorder overwrites
    /// `next_due_at` with the authoritative value when the cycle completes.
    pub async fn claim_due_targets(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Target>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                "SELECT * FROM targets
                 WHERE is_active AND NOT deleted
                   AND (next_due_at IS NULL OR next_due_at <= $1)
                 ORDER BY next_due_at ASC NULLS FIRST
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED",
                &[&now, &limit],
            )
            .await?;
        let targets: Vec<Target> = rows.into_iter().map(Target::from).collect();
        if !targets.is_empty() {
            let ids: Vec<i64> = targets.iter().map(|t| t.id).collect();
            tx.execute(
                "UPDATE targets
                 SET next_due_at = $1 + make_interval(secs => interval_secs)
                 WHERE id = ANY($2)",
                &[&now, &ids],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(targets)
    }

    /// Persist one probe cycle: append the probe log and apply the computed
    /// target state in a single transaction.
    pub async fn record_probe(&self, log: &NewProbeLog, update: &TargetUpdate) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        Self::insert_probe_log_on(&*tx, log).await?;
        tx.execute(
            "UPDATE targets SET
                 is_up = $2,
                 last_probe_at = $3,
                 next_due_at = $4,
                 last_status_code = $5,
                 last_response_time = $6,
                 total_probes = $7,
                 successful_probes = $8,
                 failed_probes = $9,
                 uptime_percent = $10,
                 min_response_time = $11,
                 avg_response_time = $12,
                 max_response_time = $13,
                 total_downtime_secs = $14,
                 downtime_events = $15,
                 current_downtime_start = $16,
                 tls_expiry = COALESCE($17, tls_expiry),
                 tls_issuer = COALESCE($18, tls_issuer),
                 tls_days_remaining = COALESCE($19, tls_days_remaining)
             WHERE id = $1",
            &[
                &update.target_id,
                &update.is_up,
                &update.last_probe_at,
                &update.next_due_at,
                &update.last_status_code,
                &update.last_response_time,
                &update.total_probes,
                &update.successful_probes,
                &update.failed_probes,
                &update.uptime_percent,
                &update.min_response_time,
                &update.avg_response_time,
                &update.max_response_time,
                &update.total_downtime_secs,
                &update.downtime_events,
                &update.current_downtime_start,
                &update.tls_expiry,
                &update.tls_issuer,
                &update.tls_days_remaining,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append a probe log outside a cycle transaction. Used for the
    /// synthetic `error_kind = "engine"` records written when the recorder
    /// itself fails.
    pub async fn insert_probe_log(&self, log: &NewProbeLog) -> Result<()> {
        let client = self.pool.get().await?;
        Self::insert_probe_log_on(&**client, log).await
    }

    async fn insert_probe_log_on(
        executor: &impl tokio_postgres::GenericClient,
        log: &NewProbeLog,
    ) -> Result<()> {
        let checked_at = log.checked_at.unwrap_or_else(Utc::now);
        executor
            .execute(
                "INSERT INTO probe_logs
                     (target_id, checked_at, success, status_code, response_time,
                      response_size, error_kind, error_message, dns_time,
                      connect_time, resolved_ip, tls_verified, retries_used, headers)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                &[
                    &log.target_id,
                    &checked_at,
                    &log.success,
                    &log.status_code,
                    &log.response_time,
                    &log.response_size,
                    &log.error_kind,
                    &log.error_message,
                    &log.dns_time,
                    &log.connect_time,
                    &log.resolved_ip,
                    &log.tls_verified,
                    &log.retries_used,
                    &log.headers,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM users WHERE id = $1 AND NOT deleted", &[&id])
            .await?;
        Ok(row.map(User::from))
    }

    /// Insert an alert row and return its id.
    pub async fn insert_alert(&self, alert: &NewAlert) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO alerts
                     (owner_id, target_id, kind, title, body, priority,
                      channels, sent, max_retries)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING id",
                &[
                    &alert.owner_id,
                    &alert.target_id,
                    &alert.kind,
                    &alert.title,
                    &alert.body,
                    &alert.priority,
                    &alert.channels,
                    &alert.sent,
                    &alert.max_retries,
                ],
            )
            .await?;
        Ok(row.get("id"))
    }

    pub async fn mark_alert_sent(&self, id: i64, retries: i32) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE alerts SET sent = TRUE, sent_at = NOW(), retries = $2 WHERE id = $1",
                &[&id, &retries],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_alert_unsent(&self, id: i64, retries: i32) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE alerts SET sent = FALSE, retries = $2 WHERE id = $1",
                &[&id, &retries],
            )
            .await?;
        Ok(())
    }

    /// Compute today's aggregate counters from the live tables.
    pub async fn aggregate_daily_stats(&self, date: NaiveDate) -> Result<DailyStats> {
        let day_start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        let day_end = day_start + chrono::Duration::days(1);
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT
                     (SELECT COUNT(*) FROM users WHERE NOT deleted) AS total_users,
                     (SELECT COUNT(*) FROM users
                        WHERE NOT deleted AND status = 'active') AS active_users,
                     (SELECT COUNT(*) FROM targets WHERE NOT deleted) AS total_targets,
                     (SELECT COUNT(*) FROM targets
                        WHERE NOT deleted AND is_active) AS active_targets,
                     (SELECT COUNT(*) FROM probe_logs
                        WHERE checked_at >= $1 AND checked_at < $2) AS total_probes,
                     (SELECT COUNT(*) FROM probe_logs
                        WHERE checked_at >= $1 AND checked_at < $2 AND success)
                         AS successful_probes,
                     (SELECT COUNT(*) FROM probe_logs
                        WHERE checked_at >= $1 AND checked_at < $2 AND NOT success)
                         AS failed_probes,
                     (SELECT AVG(response_time) FROM probe_logs
                        WHERE checked_at >= $1 AND checked_at < $2 AND success)
                         AS avg_response_time,
                     (SELECT COALESCE(SUM(total_downtime_secs), 0)::BIGINT FROM targets
                        WHERE NOT deleted) AS total_downtime_secs",
                &[&day_start, &day_end],
            )
            .await?;
        Ok(DailyStats {
            date,
            total_users: row.get("total_users"),
            active_users: row.get("active_users"),
            total_targets: row.get("total_targets"),
            active_targets: row.get("active_targets"),
            total_probes: row.get("total_probes"),
            successful_probes: row.get("successful_probes"),
            failed_probes: row.get("failed_probes"),
            avg_response_time: row.get("avg_response_time"),
            total_downtime_secs: row.get("total_downtime_secs"),
        })
    }

    /// Idempotent upsert keyed by calendar day.
    pub async fn upsert_daily_stats(&self, stats: &DailyStats) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO daily_stats
                     (date, total_users, active_users, total_targets, active_targets,
                      total_probes, successful_probes, failed_probes,
                      avg_response_time, total_downtime_secs)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (date) DO UPDATE SET
                     total_users = EXCLUDED.total_users,
                     active_users = EXCLUDED.active_users,
                     total_targets = EXCLUDED.total_targets,
                     active_targets = EXCLUDED.active_targets,
                     total_probes = EXCLUDED.total_probes,
                     successful_probes = EXCLUDED.successful_probes,
                     failed_probes = EXCLUDED.failed_probes,
                     avg_response_time = EXCLUDED.avg_response_time,
                     total_downtime_secs = EXCLUDED.total_downtime_secs",
                &[
                    &stats.date,
                    &stats.total_users,
                    &stats.active_users,
                    &stats.total_targets,
                    &stats.active_targets,
                    &stats.total_probes,
                    &stats.successful_probes,
                    &stats.failed_probes,
                    &stats.avg_response_time,
                    &stats.total_downtime_secs,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_probe_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM probe_logs WHERE checked_at < $1", &[&cutoff])
            .await?;
        Ok(deleted)
    }

    pub async fn delete_activity_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM activity_logs WHERE created_at < $1", &[&cutoff])
            .await?;
        Ok(deleted)
    }

    pub async fn delete_daily_stats_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM daily_stats WHERE date < $1", &[&cutoff])
            .await?;
        Ok(deleted)
    }

    /// Active TLS-carrying targets whose certificate expires within
    /// `max_days`. Backstop for targets probed on long intervals.
    pub async fn tls_expiring_targets(&self, max_days: i32) -> Result<Vec<Target>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM targets
                 WHERE is_active AND NOT deleted
                   AND kind IN ('https', 'tls')
                   AND tls_days_remaining IS NOT NULL
                   AND tls_days_remaining <= $1
                 ORDER BY tls_days_remaining ASC",
                &[&max_days],
            )
            .await?;
        Ok(rows.into_iter().map(Target::from).collect())
    }

    /// Mark users idle since `cutoff` as inactive. Returns affected rows.
    pub async fn mark_users_inactive_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE users SET status = $1
                 WHERE NOT deleted AND status = $2
                   AND last_active_at IS NOT NULL AND last_active_at < $3",
                &[&UserStatus::Inactive, &UserStatus::Active, &cutoff],
            )
            .await?;
        Ok(changed)
    }
}
