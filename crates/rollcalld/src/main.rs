use anyhow::{Context, Result};
use rollcall_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod recognition;
mod service;
mod training;
mod worker;

use config::{BusKind, Config};
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};
use service::AttendanceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    for dir in [
        &config.dataset_dir,
        &config.staging_dir,
        &config.output_dir,
        &config.worker_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    tracing::info!(
        data_dir = %config.data_dir.display(),
        worker = %config.worker_program,
        threshold = config.acceptance_threshold,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let bus = config.bus;
    let service = AttendanceService::new(config, store);

    let stale = service.reconcile().await?;
    if !stale.is_empty() {
        tracing::warn!(sessions = ?stale, "sessions left processing by a previous run were failed");
    }

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceInterface::new(service))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
