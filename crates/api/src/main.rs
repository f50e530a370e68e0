use std::sync::Arc;

use anyhow::Context;

use redrun_api::app::{build_app, AppServices};
use redrun_infra::config::Settings;
use redrun_observability::LogSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    redrun_observability::init(&LogSettings::from_env());

    let settings = Settings::from_env().context("invalid configuration")?;
    let bind = settings.http.bind;
    if settings.http.api_key.is_none() {
        tracing::warn!("REDRUN_API_KEY not set; API is unauthenticated");
    }

    let services = Arc::new(AppServices::from_settings(settings)?);

    let workers = if services.settings.execution.embedded_worker {
        services.sweep_on_start().await?;
        services.reconcile_on_start().await;
        Some((services.spawn_workers("api-worker"), services.spawn_sweeper()))
    } else {
        None
    };

    let app = build_app(services);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some((workers, sweeper)) = workers {
        sweeper.abort();
        workers.shutdown().await;
    }
    Ok(())
}
