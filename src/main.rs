// src/main.rs
mod alerts;
mod config;
mod engine;
mod error;
mod liveness;
mod probe;
mod recorder;
mod scheduler;
mod sink;
mod storage;
mod transition;
mod types;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings: Arc<config::Settings> = Arc::new(config::Settings::load()?);
    if settings.identity.bot_token.is_empty() {
        anyhow::bail!("bot_token is required; refusing to start without a delivery credential");
    }
    info!(
        app = %settings.identity.app_name,
        version = %settings.identity.app_version,
        "starting"
    );

    let storage: Arc<storage::Storage> =
        Arc::new(storage::Storage::connect(&settings.database).await?);
    storage.init_schema().await?;
    info!("database ready");

    let telegram: Arc<dyn sink::MessageSink> =
        Arc::new(sink::TelegramSink::new(&settings.identity.bot_token)?);

    let pipeline = alerts::AlertPipeline::new(storage.clone(), settings.clone(), telegram);
    pipeline.start();

    let engine = engine::Engine::new(storage.clone(), settings.clone(), pipeline.queue())?;
    engine.start();

    let scheduler =
        scheduler::Scheduler::with_default_jobs(storage.clone(), settings.clone(), pipeline.queue());
    scheduler.start();

    let server = liveness::HealthServer::new(&settings);
    server.start().await?;

    let pinger = liveness::SelfPinger::new(settings.clone());
    if settings.liveness.self_ping_enabled {
        pinger.start()?;
    }

    info!("all components running");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");

    // Reverse of startup: stop producing probes first, then drain alerts,
    // then tear down the keep-alive surface.
    engine.stop().await;
    scheduler.stop().await;
    pipeline.stop().await;
    if settings.liveness.self_ping_enabled {
        pinger.stop().await;
    }
    server.stop().await;

    info!("bye");
    Ok(())
}
