use std::sync::Arc;

use anyhow::Context;
use jobmesh_api::ApiConfig;
use jobmesh_api::app::services::{self, BackgroundTasks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobmesh_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(services::build_services(&config).await?);

    let background = {
        let services = services.clone();
        let embedded = config.embedded_workers;
        tokio::task::spawn_blocking(move || BackgroundTasks::start(&services, embedded))
            .await
            .context("background startup aborted")??
    };

    let app = jobmesh_api::app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = services.backend(),
        embedded_workers = config.embedded_workers,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    tokio::task::spawn_blocking(move || background.shutdown())
        .await
        .context("background shutdown aborted")?;
    tracing::info!("stopped");
    Ok(())
}
