use std::sync::Arc;
use std::time::Duration;

use auctiond::{config::AppConfig, logger::init_tracing, store::Store};
use chrono::Utc;

/// Drives the clock: the same `update_system_state` that fronts every
/// external request also runs on a fixed cadence so day rollover and
/// telemetry finalization happen even while the system is idle.
fn start_cycle_loop(store: Arc<Store>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            if let Err(e) = store.update_system_state(Utc::now()) {
                tracing::error!(error = ?e, "system state update failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting auctiond...");

    let cfg = AppConfig::from_env();
    let port = cfg.port;
    if cfg.monitor_token.is_none() {
        tracing::warn!("GPU_MONITOR_TOKEN unset; telemetry pushes will be rejected");
    }

    let store = Arc::new(Store::open(cfg)?);
    if !store.has_users() {
        tracing::warn!("no users exist; bootstrap an admin before mounting the transport");
    }

    // Populate the calendar before anything else touches the store.
    store.update_system_state(Utc::now())?;

    start_cycle_loop(store.clone(), Duration::from_secs(30));

    tracing::info!(port, "core ready; transport mounts on PORT");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    store.flush()?;
    Ok(())
}
