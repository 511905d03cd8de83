use anyhow::Context;

use stockledger_api::app::{self, services};
use stockledger_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockledger_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        app_env = %config.app_env,
        backend = ?config.storage_backend,
        "starting stockledger api"
    );

    let (services, background) = services::bootstrap(&config)
        .await
        .context("failed to wire backends")?;

    let app = app::build_app(std::sync::Arc::new(services));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Some(stats) = background.shutdown().await {
        tracing::info!(
            messages = stats.messages,
            items_applied = stats.items_applied,
            items_failed = stats.items_failed,
            "order ingester stopped"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
