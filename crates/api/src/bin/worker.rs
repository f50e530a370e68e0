//! Standalone worker: drains the shared queue until interrupted.

use std::sync::Arc;

use anyhow::Context;

use redrun_api::app::AppServices;
use redrun_infra::config::Settings;
use redrun_observability::LogSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    redrun_observability::init(&LogSettings::from_env());

    let settings = Settings::from_env().context("invalid configuration")?;
    let services = Arc::new(AppServices::from_settings(settings)?);

    services.sweep_on_start().await?;
    services.reconcile_on_start().await;

    let pool = services.spawn_workers("worker");
    tracing::info!(
        concurrency = services.settings.execution.concurrency,
        engine = %services.settings.execution.engine_program.display(),
        "worker started"
    );

    let sweeper = services.spawn_sweeper();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    sweeper.abort();
    let stats = pool.stats();
    pool.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        rejected = stats.jobs_rejected,
        "worker stopped"
    );
    Ok(())
}
