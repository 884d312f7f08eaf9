use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Instant;
use tracing::{error, info};

mod config;
mod display;
mod engine;
mod models;
mod probe;
mod renderer;
mod speed;
mod store;
mod utils;

use crate::config::PanelConfig;
use crate::display::{DisplayEngine, ShutdownReason};
use crate::engine::PollScheduler;
use crate::probe::NetworkProber;
use crate::store::StatusStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .init();

    let config_path = std::env::var_os("PI_MONITOR_CONFIG")
        .map_or_else(|| PathBuf::from("config.json"), PathBuf::from);
    let config = Arc::new(PanelConfig::load(&config_path)?);

    let prober = Arc::new(NetworkProber::new(config.speed_test.clone()));
    let store = StatusStore::load_or_default(&config);
    let mut renderer = renderer::open(&config.display)?;

    let scheduler = PollScheduler::new(Arc::clone(&config), prober, store.clone());
    let stats = scheduler.stats();
    let poller = tokio::spawn(scheduler.run());

    let engine = DisplayEngine::new(&config.display, Instant::now());
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let reason = engine.run(&store, renderer.as_mut(), shutdown).await;

    poller.abort();
    info!(
        "Probe cycles: {} started, {} completed, {} ticks skipped",
        stats.started.load(Ordering::Relaxed),
        stats.completed.load(Ordering::Relaxed),
        stats.skipped.load(Ordering::Relaxed)
    );
    match reason {
        ShutdownReason::Interrupted => info!("Shutdown signal received. Panel cleared."),
        ShutdownReason::RendererFailed => error!("Display failed. Panel stopped."),
    }
    Ok(())
}
