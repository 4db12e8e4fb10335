//! engine.rs — Database-driven monitoring engine.
//!
//! One sweep loop pulls due targets in batches, fans them out as probe
//! tasks under a semaphore, and sleeps between sweeps. Per-target
//! serialization comes from the claim in `Storage::claim_due_targets`:
//! a claimed target is not due again until its provisional `next_due_at`
//! passes, so two cycles for the same target never overlap.
//!
//! Nothing but `stop()` halts the loop: selection errors skip the sweep,
//! recorder errors leave a synthetic probe log, probe errors are already
//! folded into results.

use crate::alerts::AlertQueue;
use crate::config::Settings;
use crate::probe::Prober;
use crate::recorder;
use crate::storage::Storage;
use crate::transition;
use crate::types::{NewProbeLog, Target};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

pub struct Engine {
    storage: Arc<Storage>,
    settings: Arc<Settings>,
    prober: Arc<Prober>,
    alerts: AlertQueue,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        storage: Arc<Storage>,
        settings: Arc<Settings>,
        alerts: AlertQueue,
    ) -> anyhow::Result<Self> {
        let prober = Arc::new(Prober::new(
            &settings.identity.app_name,
            &settings.identity.app_version,
            settings.engine.expected_status_codes.clone(),
        )?);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            storage,
            settings,
            prober,
            alerts,
            shutdown,
            handle: Mutex::new(None),
        })
    }

    /// Launch the sweep loop in the background.
    pub fn start(&self) {
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_loop(
            self.storage.clone(),
            self.settings.clone(),
            self.prober.clone(),
            self.alerts.clone(),
            shutdown,
        ));
        *self.handle.lock().expect("engine handle lock") = Some(handle);
        info!(
            sweep_interval_secs = self.settings.engine.sweep_interval_secs,
            max_concurrent = self.settings.engine.max_concurrent_probes,
            "monitoring engine started"
        );
    }

    /// Request termination and wait for in-flight probes to complete.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("engine handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "engine join failed");
            }
        }
        info!("monitoring engine stopped");
    }
}

async fn run_loop(
    storage: Arc<Storage>,
    settings: Arc<Settings>,
    prober: Arc<Prober>,
    alerts: AlertQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(settings.engine.max_concurrent_probes));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut ticker = interval(Duration::from_secs(settings.engine.sweep_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'sweep: loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        // Reap completed probe tasks so the set does not grow unbounded.
        while tasks.try_join_next().is_some() {}

        let now = Utc::now();
        let batch = match storage
            .claim_due_targets(settings.engine.batch_size, now)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "target selection failed, skipping sweep");
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }
        debug!(count = batch.len(), "sweep dispatching probes");

        for target in batch {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'sweep,
                },
                _ = shutdown.changed() => break 'sweep,
            };
            let storage = storage.clone();
            let settings = settings.clone();
            let prober = prober.clone();
            let alerts = alerts.clone();
            tasks.spawn(async move {
                probe_cycle(&storage, &settings, &prober, &alerts, target).await;
                drop(permit);
            });
        }
    }

    // In-flight probes finish normally; their timeouts bound the wait.
    while tasks.join_next().await.is_some() {}
}

/// One full cycle for one target: probe → record → detect → enqueue.
async fn probe_cycle(
    storage: &Storage,
    settings: &Settings,
    prober: &Prober,
    alerts: &AlertQueue,
    target: Target,
) {
    let result = prober.run(&target).await;
    let now = Utc::now();
    debug!(
        target_id = target.id,
        kind = target.kind.as_str(),
        success = result.success,
        status = ?result.status_code,
        "probe completed"
    );

    match recorder::record(storage, &target, &result, now).await {
        Ok(_) => {
            for intent in
                transition::detect(&target, &result, now, settings.tls.expiry_warning_days)
            {
                alerts.enqueue(intent);
            }
        }
        Err(e) => {
            // The target must stay visible in the probe history even when
            // the recorder faults; state stays at its previous values.
            error!(target_id = target.id, error = %e, "recorder failed, writing synthetic log");
            let synthetic = NewProbeLog {
                target_id: target.id,
                checked_at: Some(now),
                success: false,
                error_kind: Some("engine".to_string()),
                error_message: Some(e.to_string()),
                ..NewProbeLog::default()
            };
            if let Err(e) = storage.insert_probe_log(&synthetic).await {
                warn!(target_id = target.id, error = %e, "synthetic probe log also failed");
            }
        }
    }
}
