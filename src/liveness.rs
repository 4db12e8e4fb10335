//! liveness.rs — Keep-alive surface for the hosting platform.
//!
//! Two cooperating pieces, mirroring how free-tier hosts detect activity:
//! a small axum server exposing `/`, `/ping`, `/health` and `/status`, and
//! a self-pinger that periodically GETs the public `/ping` URL so the
//! platform sees real traffic through its load balancer.

use crate::config::{LivenessSettings, Settings};
use crate::probe::backoff_delay;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct ServerState(Arc<ServerInner>);

struct ServerInner {
    app_name: String,
    app_version: String,
    port: u16,
    started: Instant,
    requests_served: AtomicU64,
}

impl ServerState {
    fn bump(&self) {
        self.0.requests_served.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_seconds: u64,
    requests_served: u64,
    timestamp: String,
    port: u16,
    app_name: String,
    app_version: String,
}

async fn root(State(state): State<ServerState>) -> &'static str {
    state.bump();
    "OK"
}

async fn ping(State(state): State<ServerState>) -> &'static str {
    state.bump();
    "pong"
}

async fn health(State(state): State<ServerState>) -> Json<HealthBody> {
    state.bump();
    let inner = &state.0;
    Json(HealthBody {
        status: "healthy",
        uptime_seconds: inner.started.elapsed().as_secs(),
        requests_served: inner.requests_served.load(Ordering::Relaxed),
        timestamp: Utc::now().to_rfc3339(),
        port: inner.port,
        app_name: inner.app_name.clone(),
        app_version: inner.app_version.clone(),
    })
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/status", get(health))
        .with_state(state)
}

/// HTTP liveness server bound to the configured port.
pub struct HealthServer {
    state: ServerState,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthServer {
    pub fn new(settings: &Settings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: ServerState(Arc::new(ServerInner {
                app_name: settings.identity.app_name.clone(),
                app_version: settings.identity.app_version.clone(),
                port: settings.liveness.port,
                started: Instant::now(),
                requests_served: AtomicU64::new(0),
            })),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Bind and serve. Binding failures are fatal: the hosting platform
    /// kills instances that never open the expected port.
    pub async fn start(&self) -> anyhow::Result<()> {
        let port = self.state.0.port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let app = router(self.state.clone());
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "liveness server failed");
            }
        });
        *self.handle.lock().expect("server handle lock") = Some(handle);
        info!(port, "liveness server listening");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("server handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "liveness server join failed");
            }
        }
        info!("liveness server stopped");
    }
}

/// Resolve the URL the self-pinger should hit: explicit config, then the
/// platform's public URL variable, then localhost.
pub fn resolve_ping_url(liveness: &LivenessSettings, external_url: Option<&str>) -> String {
    if let Some(url) = &liveness.self_ping_url {
        return url.clone();
    }
    if let Some(external) = external_url {
        if !external.is_empty() {
            return format!("{}/ping", external.trim_end_matches('/'));
        }
    }
    format!("http://localhost:{}/ping", liveness.port)
}

/// Periodic outbound GET against the liveness endpoint.
pub struct SelfPinger {
    settings: Arc<Settings>,
    successes: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SelfPinger {
    pub fn new(settings: Arc<Settings>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            successes: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let liveness = self.settings.liveness.clone();
        let url = resolve_ping_url(
            &liveness,
            std::env::var("RENDER_EXTERNAL_URL").ok().as_deref(),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(liveness.self_ping_timeout_secs))
            .build()?;
        let successes = self.successes.clone();
        let failures = self.failures.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(liveness.self_ping_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it
            // so the server has time to come up.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if ping_once(&client, &url, liveness.self_ping_retries).await {
                    successes.fetch_add(1, Ordering::Relaxed);
                } else {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    url = %url,
                    ok = successes.load(Ordering::Relaxed),
                    failed = failures.load(Ordering::Relaxed),
                    "self-ping round finished"
                );
            }
        });
        *self.handle.lock().expect("pinger handle lock") = Some(handle);
        info!("self-pinger started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("pinger handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "self-pinger join failed");
            }
        }
        info!("self-pinger stopped");
    }

    pub fn counters(&self) -> (u64, u64) {
        (
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

async fn ping_once(client: &reqwest::Client, url: &str, retries: u32) -> bool {
    for attempt in 0..=retries {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                warn!(status = %response.status(), attempt, "self-ping got non-success status");
            }
            Err(e) => {
                warn!(error = %e, attempt, "self-ping request failed");
            }
        }
        if attempt < retries {
            tokio::time::sleep(backoff_delay(1, attempt)).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_url_resolution_precedence() {
        let mut liveness = LivenessSettings::default();
        liveness.port = 10_000;

        // Explicit config wins.
        liveness.self_ping_url = Some("https://monitor.example.com/ping".into());
        assert_eq!(
            resolve_ping_url(&liveness, Some("https://app.onrender.com")),
            "https://monitor.example.com/ping"
        );

        // Platform URL next, slash-normalized.
        liveness.self_ping_url = None;
        assert_eq!(
            resolve_ping_url(&liveness, Some("https://app.onrender.com/")),
            "https://app.onrender.com/ping"
        );

        // Localhost fallback.
        assert_eq!(
            resolve_ping_url(&liveness, None),
            "http://localhost:10000/ping"
        );
        assert_eq!(
            resolve_ping_url(&liveness, Some("")),
            "http://localhost:10000/ping"
        );
    }

    #[test]
    fn health_body_serializes_expected_fields() {
        let body = HealthBody {
            status: "healthy",
            uptime_seconds: 12,
            requests_served: 3,
            timestamp: Utc::now().to_rfc3339(),
            port: 10_000,
            app_name: "upwatch".into(),
            app_version: "1.0.0".into(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["port"], 10_000);
        assert!(value.get("uptime_seconds").is_some());
        assert!(value.get("requests_served").is_some());
        assert!(value.get("app_version").is_some());
    }
}
