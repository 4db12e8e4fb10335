//! alerts.rs — Queued, rate-limited, deduplicating alert pipeline.
//!
//! The engine and scheduler push [`AlertIntent`]s through a bounded queue;
//! a single dispatcher task applies per-target cooldown and per-owner rate
//! limiting, persists every surviving alert, and delivers through the
//! messaging sink with exponential-backoff retry. The queue decouples the
//! probe hot path from delivery: enqueueing never blocks, and when the
//! queue is full the intent is dropped with a warning rather than stalling
//! probes.
//!
//! Cooldown and rate-limit state live inside the dispatcher task; the only
//! way to touch them from outside is a control message on the same queue.

use crate::config::Settings;
use crate::error::SinkError;
use crate::probe::backoff_delay;
use crate::sink::MessageSink;
use crate::storage::Storage;
use crate::transition::AlertIntent;
use crate::types::{AlertKind, NewAlert};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum Command {
    Dispatch(AlertIntent),
    SweepCooldowns,
}

/// Cloneable producer side of the pipeline.
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<Command>,
}

impl AlertQueue {
    /// Non-blocking enqueue. A full queue drops the intent: probe
    /// availability wins over a redundant notification.
    pub fn enqueue(&self, intent: AlertIntent) {
        match self.tx.try_send(Command::Dispatch(intent)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Command::Dispatch(intent))) => {
                warn!(
                    target_id = intent.target_id,
                    kind = ?intent.kind,
                    "alert queue full, dropping intent"
                );
            }
            Err(_) => warn!("alert pipeline is stopped, dropping intent"),
        }
    }

    /// Ask the dispatcher to evict stale cooldown entries.
    pub fn sweep_cooldowns(&self) {
        let _ = self.tx.try_send(Command::SweepCooldowns);
    }
}

/// Per-target suppression window. Recovery alerts are never suppressed.
struct CooldownMap {
    window: Duration,
    last_fired: HashMap<i64, DateTime<Utc>>,
}

impl CooldownMap {
    fn new(window_secs: i64) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            last_fired: HashMap::new(),
        }
    }

    /// Returns whether the intent may proceed, refreshing the timestamp
    /// when it does.
    fn allow(&mut self, target_id: i64, kind: AlertKind, now: DateTime<Utc>) -> bool {
        if !matches!(kind, AlertKind::Down | AlertKind::Slow | AlertKind::TlsExpiry) {
            return true;
        }
        if let Some(last) = self.last_fired.get(&target_id) {
            if now - *last < self.window {
                return false;
            }
        }
        self.last_fired.insert(target_id, now);
        true
    }

    /// Evict entries older than twice the window.
    fn gc(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = self.window * 2;
        let before = self.last_fired.len();
        self.last_fired.retain(|_, fired| now - *fired < horizon);
        before - self.last_fired.len()
    }
}

/// Per-owner sliding window of delivered alerts.
struct RateWindow {
    capacity: usize,
    span: Duration,
    delivered: HashMap<i64, VecDeque<DateTime<Utc>>>,
}

impl RateWindow {
    fn new(capacity: usize, span_secs: i64) -> Self {
        Self {
            capacity,
            span: Duration::seconds(span_secs),
            delivered: HashMap::new(),
        }
    }

    /// True when the owner has already used up the window.
    fn is_limited(&mut self, owner_id: i64, now: DateTime<Utc>) -> bool {
        let window = self.delivered.entry(owner_id).or_default();
        while window.front().is_some_and(|t| now - *t >= self.span) {
            window.pop_front();
        }
        window.len() >= self.capacity
    }

    /// Record a successful delivery.
    fn record(&mut self, owner_id: i64, now: DateTime<Utc>) {
        self.delivered.entry(owner_id).or_default().push_back(now);
    }

    fn gc(&mut self, now: DateTime<Utc>) {
        let span = self.span;
        self.delivered.retain(|_, window| {
            while window.front().is_some_and(|t| now - *t >= span) {
                window.pop_front();
            }
            !window.is_empty()
        });
    }
}

/// Dispatcher: cooldown → rate limit → persist → deliver with retry.
pub struct AlertPipeline {
    queue: AlertQueue,
    rx: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    storage: Arc<Storage>,
    settings: Arc<Settings>,
    sink: Arc<dyn MessageSink>,
}

impl AlertPipeline {
    pub fn new(
        storage: Arc<Storage>,
        settings: Arc<Settings>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.alerts.queue_cap);
        let (shutdown, _) = watch::channel(false);
        Self {
            queue: AlertQueue { tx },
            rx: Mutex::new(Some(rx)),
            shutdown,
            handle: Mutex::new(None),
            storage,
            settings,
            sink,
        }
    }

    pub fn queue(&self) -> AlertQueue {
        self.queue.clone()
    }

    pub fn start(&self) {
        let rx = self
            .rx
            .lock()
            .expect("pipeline receiver lock")
            .take()
            .expect("pipeline started twice");
        let shutdown = self.shutdown.subscribe();
        let storage = self.storage.clone();
        let settings = self.settings.clone();
        let sink = self.sink.clone();
        let handle = tokio::spawn(dispatch_loop(storage, settings, sink, rx, shutdown));
        *self.handle.lock().expect("pipeline handle lock") = Some(handle);
        info!("alert pipeline started");
    }

    /// Stop the dispatcher. Intents still queued are persisted unsent so
    /// nothing is silently lost.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("pipeline handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "alert dispatcher join failed");
            }
        }
        info!("alert pipeline stopped");
    }
}

async fn dispatch_loop(
    storage: Arc<Storage>,
    settings: Arc<Settings>,
    sink: Arc<dyn MessageSink>,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cooldowns = CooldownMap::new(settings.alerts.cooldown_secs);
    let mut window = RateWindow::new(settings.alerts.max_alerts_per_hour, 3600);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Dispatch(intent)) => {
                    dispatch_one(
                        &storage,
                        &settings,
                        sink.as_ref(),
                        &mut cooldowns,
                        &mut window,
                        intent,
                    )
                    .await;
                }
                Some(Command::SweepCooldowns) => {
                    let now = Utc::now();
                    let evicted = cooldowns.gc(now);
                    window.gc(now);
                    debug!(evicted, "cooldown map swept");
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    // Drain whatever is still queued into unsent alert rows.
    rx.close();
    let mut drained = 0usize;
    while let Ok(command) = rx.try_recv() {
        if let Command::Dispatch(intent) = command {
            let alert = build_alert(&settings, &intent);
            if let Err(e) = storage.insert_alert(&alert).await {
                error!(error = %e, "failed to persist queued alert during drain");
            }
            drained += 1;
        }
    }
    if drained > 0 {
        info!(drained, "persisted undelivered alerts on shutdown");
    }
}

async fn dispatch_one(
    storage: &Storage,
    settings: &Settings,
    sink: &dyn MessageSink,
    cooldowns: &mut CooldownMap,
    window: &mut RateWindow,
    intent: AlertIntent,
) {
    let now = Utc::now();

    if !cooldowns.allow(intent.target_id, intent.kind, now) {
        debug!(
            target_id = intent.target_id,
            kind = ?intent.kind,
            "alert suppressed by cooldown"
        );
        return;
    }

    let limited = window.is_limited(intent.owner_id, now);
    let alert = build_alert(settings, &intent);
    let alert_id = match storage.insert_alert(&alert).await {
        Ok(id) => id,
        Err(e) => {
            error!(owner_id = intent.owner_id, error = %e, "failed to persist alert");
            return;
        }
    };

    if limited {
        warn!(
            owner_id = intent.owner_id,
            alert_id, "owner rate-limited, alert persisted unsent"
        );
        return;
    }

    let user = match storage.get_user(intent.owner_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(owner_id = intent.owner_id, alert_id, "alert owner not found");
            return;
        }
        Err(e) => {
            error!(owner_id = intent.owner_id, error = %e, "owner lookup failed");
            return;
        }
    };

    let max_retries = settings.alerts.retry_count;
    let mut attempt: u32 = 0;
    loop {
        match sink.send(user.chat_id, &alert.body).await {
            Ok(()) => {
                window.record(intent.owner_id, now);
                if let Err(e) = storage.mark_alert_sent(alert_id, attempt as i32).await {
                    error!(alert_id, error = %e, "failed to mark alert sent");
                }
                return;
            }
            Err(SinkError::Permanent(msg)) => {
                error!(alert_id, chat_id = user.chat_id, %msg, "permanent delivery failure");
                let _ = storage.mark_alert_unsent(alert_id, attempt as i32).await;
                return;
            }
            Err(SinkError::Transient(msg)) if attempt < max_retries => {
                debug!(alert_id, attempt, %msg, "transient delivery failure, retrying");
                tokio::time::sleep(backoff_delay(1, attempt)).await;
                attempt += 1;
            }
            Err(SinkError::Transient(msg)) => {
                warn!(alert_id, %msg, "delivery retries exhausted, alert left unsent");
                let _ = storage.mark_alert_unsent(alert_id, attempt as i32).await;
                return;
            }
        }
    }
}

fn build_alert(settings: &Settings, intent: &AlertIntent) -> NewAlert {
    let (title, body) = render(intent);
    NewAlert {
        owner_id: intent.owner_id,
        target_id: Some(intent.target_id),
        kind: intent.kind,
        title,
        body,
        priority: priority_of(intent.kind),
        channels: vec!["telegram".to_string()],
        sent: false,
        max_retries: settings.alerts.retry_count as i32,
    }
}

fn priority_of(kind: AlertKind) -> i16 {
    match kind {
        AlertKind::Down | AlertKind::Error => 2,
        AlertKind::Up | AlertKind::TlsExpiry | AlertKind::Warning => 1,
        AlertKind::Slow | AlertKind::Maintenance => 0,
    }
}

/// Render the HTML message shown to the recipient.
fn render(intent: &AlertIntent) -> (String, String) {
    let name = escape_html(&intent.target_name);
    let url = escape_html(&intent.target_url);
    match intent.kind {
        AlertKind::Down => {
            let reason = intent
                .error_message
                .as_deref()
                .unwrap_or("no response");
            let title = format!("{} is DOWN", intent.target_name);
            let body = format!(
                "🔴 <b>{name} is DOWN</b>\n{url}\n<i>{}</i>",
                escape_html(reason)
            );
            (title, body)
        }
        AlertKind::Up => {
            let downtime = human_duration(intent.downtime_secs.unwrap_or(0));
            let title = format!("{} is UP", intent.target_name);
            let body = format!(
                "🟢 <b>{name} is UP</b>\n{url}\nDown for {downtime}"
            );
            (title, body)
        }
        AlertKind::Slow => {
            let rt = intent.response_time.unwrap_or(0.0);
            let title = format!("{} is responding slowly", intent.target_name);
            let body = format!(
                "🐢 <b>{name} is slow</b>\n{url}\nResponse took {rt:.2}s"
            );
            (title, body)
        }
        AlertKind::TlsExpiry => {
            let days = intent.tls_days_remaining.unwrap_or(0);
            let title = format!("{} certificate expires soon", intent.target_name);
            let body = format!(
                "🔒 <b>Certificate for {name} expires in {days} day(s)</b>\n{url}"
            );
            (title, body)
        }
        AlertKind::Maintenance | AlertKind::Error | AlertKind::Warning => {
            let detail = intent.error_message.as_deref().unwrap_or("");
            let title = format!("{}: notice", intent.target_name);
            let body = format!(
                "ℹ️ <b>{name}</b>\n{url}\n{}",
                escape_html(detail)
            );
            (title, body)
        }
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn human_duration(secs: i64) -> String {
    let secs = secs.max(0);
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(kind: AlertKind) -> AlertIntent {
        AlertIntent {
            owner_id: 42,
            target_id: 7,
            target_name: "example".into(),
            target_url: "https://example.com".into(),
            kind,
            error_message: Some("connection refused".into()),
            response_time: Some(6.5),
            downtime_secs: Some(180),
            tls_days_remaining: Some(7),
        }
    }

    #[test]
    fn cooldown_suppresses_repeats_but_never_recoveries() {
        let mut cooldowns = CooldownMap::new(300);
        let now = Utc::now();

        assert!(cooldowns.allow(7, AlertKind::Down, now));
        assert!(!cooldowns.allow(7, AlertKind::Down, now + Duration::seconds(60)));
        assert!(!cooldowns.allow(7, AlertKind::TlsExpiry, now + Duration::seconds(120)));
        // Recovery passes through during an active cooldown.
        assert!(cooldowns.allow(7, AlertKind::Up, now + Duration::seconds(60)));
        // A different target has its own window.
        assert!(cooldowns.allow(8, AlertKind::Down, now));
        // The window eventually reopens.
        assert!(cooldowns.allow(7, AlertKind::Down, now + Duration::seconds(301)));
    }

    #[test]
    fn cooldown_gc_evicts_stale_entries() {
        let mut cooldowns = CooldownMap::new(300);
        let now = Utc::now();
        assert!(cooldowns.allow(1, AlertKind::Down, now));
        assert!(cooldowns.allow(2, AlertKind::Down, now + Duration::seconds(550)));

        let evicted = cooldowns.gc(now + Duration::seconds(650));
        assert_eq!(evicted, 1);
        // Entry 2 is still inside 2× the window.
        assert!(!cooldowns.allow(2, AlertKind::Down, now + Duration::seconds(700)));
    }

    #[test]
    fn rate_window_enforces_hourly_capacity() {
        let mut window = RateWindow::new(3, 3600);
        let now = Utc::now();

        for _ in 0..3 {
            assert!(!window.is_limited(42, now));
            window.record(42, now);
        }
        assert!(window.is_limited(42, now + Duration::seconds(10)));
        // Another owner is unaffected.
        assert!(!window.is_limited(43, now));
        // Entries age out of the sliding hour.
        assert!(!window.is_limited(42, now + Duration::seconds(3601)));
    }

    #[test]
    fn recovery_body_reports_downtime() {
        let (_, body) = render(&intent(AlertKind::Up));
        assert!(body.contains("Down for 3m 0s"));
        assert!(body.contains("example"));
    }

    #[test]
    fn down_body_carries_reason_and_markup() {
        let (title, body) = render(&intent(AlertKind::Down));
        assert_eq!(title, "example is DOWN");
        assert!(body.contains("<b>"));
        assert!(body.contains("connection refused"));
    }

    #[test]
    fn html_is_escaped() {
        let mut bad = intent(AlertKind::Down);
        bad.target_name = "<script>".into();
        let (_, body) = render(&bad);
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
    }

    #[test]
    fn durations_humanize() {
        assert_eq!(human_duration(45), "45s");
        assert_eq!(human_duration(180), "3m 0s");
        assert_eq!(human_duration(7260), "2h 1m");
        assert_eq!(human_duration(-5), "0s");
    }

    #[test]
    fn priorities_rank_down_highest() {
        assert!(priority_of(AlertKind::Down) > priority_of(AlertKind::Up));
        assert!(priority_of(AlertKind::Up) > priority_of(AlertKind::Slow));
    }
}
