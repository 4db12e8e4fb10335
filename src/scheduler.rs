//! scheduler.rs — Cooperative periodic job runner.
//!
//! A single dispatcher loop ticks every two seconds and launches every
//! enabled job whose due time has passed as a background task. A job that
//! is still running when it comes due again is skipped for that round, so
//! at most one instance of each job is in flight. Job failures are counted
//! and logged, never fatal.
//!
//! Built-in jobs: daily-stats aggregation, log retention, TLS expiry
//! backstop sweep, cooldown-map GC, inactive-user sweep and a heartbeat.

use crate::alerts::AlertQueue;
use crate::config::Settings;
use crate::storage::Storage;
use crate::transition::AlertIntent;
use crate::types::AlertKind;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

const TICK: Duration = Duration::from_secs(2);

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type JobAction = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    name: &'static str,
    period: ChronoDuration,
    enabled: bool,
    next_due: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    runs: u64,
    errors: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    action: JobAction,
}

impl Job {
    fn new(name: &'static str, period_secs: i64, action: JobAction) -> Self {
        let period = ChronoDuration::seconds(period_secs);
        Self {
            name,
            period,
            enabled: true,
            // First run happens one full period after startup.
            next_due: Utc::now() + period,
            last_run: None,
            runs: 0,
            errors: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            action,
        }
    }
}

pub struct Scheduler {
    jobs: Mutex<Option<Vec<Job>>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    fn new(jobs: Vec<Job>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(Some(jobs)),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Build the scheduler with the built-in job set.
    pub fn with_default_jobs(
        storage: Arc<Storage>,
        settings: Arc<Settings>,
        alerts: AlertQueue,
    ) -> Self {
        let mut jobs = Vec::new();

        {
            let storage = storage.clone();
            jobs.push(Job::new(
                "metrics.aggregate",
                300,
                Arc::new(move || {
                    let storage = storage.clone();
                    Box::pin(async move {
                        let today = Utc::now().date_naive();
                        let stats = storage.aggregate_daily_stats(today).await?;
                        storage.upsert_daily_stats(&stats).await?;
                        debug!(
                            probes = stats.total_probes,
                            targets = stats.active_targets,
                            "daily stats aggregated"
                        );
                        Ok(())
                    })
                }),
            ));
        }

        {
            let storage = storage.clone();
            let retention = settings.retention.clone();
            jobs.push(Job::new(
                "logs.cleanup",
                86_400,
                Arc::new(move || {
                    let storage = storage.clone();
                    let retention = retention.clone();
                    Box::pin(async move {
                        let cutoff =
                            Utc::now() - ChronoDuration::days(retention.log_retention_days);
                        let probes = storage.delete_probe_logs_before(cutoff).await?;
                        let activity = storage.delete_activity_logs_before(cutoff).await?;
                        let stats_cutoff = Utc::now().date_naive()
                            - ChronoDuration::days(retention.stats_history_days);
                        let stats = storage.delete_daily_stats_before(stats_cutoff).await?;
                        info!(probes, activity, stats, "retention cleanup done");
                        Ok(())
                    })
                }),
            ));
        }

        {
            // Backstop for targets probed on long intervals; the pipeline
            // cooldown deduplicates against intents the engine already
            // emitted from normal probes.
            let storage = storage.clone();
            let alerts_queue = alerts.clone();
            let warning_days = settings.tls.expiry_warning_days;
            jobs.push(Job::new(
                "tls.sweep",
                21_600,
                Arc::new(move || {
                    let storage = storage.clone();
                    let alerts_queue = alerts_queue.clone();
                    Box::pin(async move {
                        let expiring = storage.tls_expiring_targets(warning_days).await?;
                        let count = expiring.len();
                        for target in expiring {
                            alerts_queue.enqueue(AlertIntent {
                                owner_id: target.owner_id,
                                target_id: target.id,
                                target_name: target.name.clone(),
                                target_url: target.url.clone(),
                                kind: AlertKind::TlsExpiry,
                                error_message: None,
                                response_time: None,
                                downtime_secs: None,
                                tls_days_remaining: target.tls_days_remaining,
                            });
                        }
                        if count > 0 {
                            info!(count, "tls expiry sweep enqueued intents");
                        }
                        Ok(())
                    })
                }),
            ));
        }

        {
            let alerts_queue = alerts.clone();
            jobs.push(Job::new(
                "cooldown.gc",
                3_600,
                Arc::new(move || {
                    let alerts_queue = alerts_queue.clone();
                    Box::pin(async move {
                        alerts_queue.sweep_cooldowns();
                        Ok(())
                    })
                }),
            ));
        }

        {
            let storage = storage.clone();
            jobs.push(Job::new(
                "users.inactive",
                86_400,
                Arc::new(move || {
                    let storage = storage.clone();
                    Box::pin(async move {
                        let cutoff = Utc::now() - ChronoDuration::days(90);
                        let marked = storage.mark_users_inactive_since(cutoff).await?;
                        if marked > 0 {
                            info!(marked, "users marked inactive");
                        }
                        Ok(())
                    })
                }),
            ));
        }

        {
            let storage = storage.clone();
            jobs.push(Job::new(
                "heartbeat",
                600,
                Arc::new(move || {
                    let storage = storage.clone();
                    Box::pin(async move {
                        storage.health_check().await?;
                        info!("heartbeat: database reachable, scheduler alive");
                        Ok(())
                    })
                }),
            ));
        }

        Self::new(jobs)
    }

    pub fn start(&self) {
        let jobs = self
            .jobs
            .lock()
            .expect("scheduler jobs lock")
            .take()
            .expect("scheduler started twice");
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(dispatch_loop(jobs, shutdown));
        *self.handle.lock().expect("scheduler handle lock") = Some(handle);
        info!("periodic scheduler started");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("scheduler handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler join failed");
            }
        }
        info!("periodic scheduler stopped");
    }
}

async fn dispatch_loop(mut jobs: Vec<Job>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let now = Utc::now();
        for job in jobs.iter_mut() {
            if !job.enabled || now < job.next_due {
                continue;
            }
            job.next_due = now + job.period;
            if job.running.load(Ordering::Acquire) {
                debug!(job = job.name, "previous run still in flight, skipping");
                continue;
            }
            job.last_run = Some(now);
            job.runs += 1;
            job.running.store(true, Ordering::Release);

            let name = job.name;
            let action = job.action.clone();
            let running = job.running.clone();
            let errors = job.errors.clone();
            tokio::spawn(async move {
                debug!(job = name, "job starting");
                if let Err(e) = (action)().await {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!(job = name, error = %e, "job failed");
                }
                running.store(false, Ordering::Release);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_job(name: &'static str, period_secs: i64) -> Job {
        Job::new(name, period_secs, Arc::new(|| Box::pin(async { Ok(()) })))
    }

    #[test]
    fn first_run_is_one_period_out() {
        let before = Utc::now();
        let job = noop_job("j", 300);
        assert!(job.next_due >= before + ChronoDuration::seconds(300));
        assert!(job.next_due <= Utc::now() + ChronoDuration::seconds(300));
        assert_eq!(job.runs, 0);
        assert!(job.enabled);
    }

    #[test]
    fn overlap_flag_blocks_second_instance() {
        let job = noop_job("j", 60);
        assert!(!job.running.load(Ordering::Acquire));
        job.running.store(true, Ordering::Release);
        assert!(job.running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn due_jobs_run_and_advance() {
        let counter = Arc::new(AtomicU64::new(0));
        let action_counter = counter.clone();
        let mut job = Job::new(
            "counting",
            60,
            Arc::new(move || {
                let counter = action_counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        // Force the job due now and run one dispatcher round by hand.
        job.next_due = Utc::now() - ChronoDuration::seconds(1);
        let now = Utc::now();
        assert!(now >= job.next_due);
        job.next_due = now + job.period;
        job.runs += 1;
        (job.action)().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(job.next_due > now);
    }

    #[tokio::test]
    async fn failing_job_counts_errors() {
        let job = Job::new(
            "failing",
            60,
            Arc::new(|| Box::pin(async { anyhow::bail!("boom") })),
        );
        if (job.action)().await.is_err() {
            job.errors.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(job.errors.load(Ordering::Relaxed), 1);
    }
}
