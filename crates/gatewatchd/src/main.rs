use anyhow::{Context, Result};
use gatewatch_core::attendance::AttendanceDesk;
use gatewatch_core::identity::{HttpIdentityService, IdentityService};
use gatewatch_core::pipeline::Pipeline;
use gatewatch_core::store::SqliteStore;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{GatewatchService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        "gatewatchd starting"
    );

    let engine = engine::spawn_engine(
        &config.camera_device,
        config.camera_width,
        config.camera_height,
        &config.model_dir,
        config.warmup_frames,
    )?;

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening identity store {}", config.db_path.display()))?;
    let http = HttpIdentityService::new(config.api_base_url.clone(), config.request_timeout())?;
    tracing::info!(base_url = http.base_url(), "visitor service configured");
    let service: Arc<dyn IdentityService> = Arc::new(http);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Pipeline::start(
        engine.clone(),
        engine.clone(),
        service.clone(),
        Box::new(store),
        config.pipeline_config(),
        shutdown_rx,
    )?;

    tokio::spawn(log_label_updates(pipeline.context.resolver.subscribe()));

    let desk = AttendanceDesk::new(service, config.jpeg_quality);
    let dbus = GatewatchService::new(pipeline.context.clone(), desk, engine);
    let _connection = zbus::connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus)?
        .build()
        .await
        .context("registering on the system bus")?;

    tracing::info!(bus = BUS_NAME, "gatewatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("gatewatchd shutting down");
    let _ = shutdown_tx.send(true);

    match pipeline.detection.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "detection loop ended with error"),
        Err(e) => tracing::warn!(error = %e, "detection loop task failed"),
    }
    if let Err(e) = pipeline.resolver.await {
        tracing::warn!(error = %e, "resolver task failed");
    }

    Ok(())
}

async fn log_label_updates(mut updates: broadcast::Receiver<gatewatch_core::resolver::LabelUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => tracing::info!(
                snapshot = %update.snapshot_id,
                label = %update.label,
                from_cache = update.from_cache,
                "snapshot labelled"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "label log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
