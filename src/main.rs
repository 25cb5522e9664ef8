use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use wide_deploy_api::AppState;
use wide_deploy_api::bootstrap;
use wide_deploy_api::config::GatewayConfig;
use wide_deploy_api::handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("wide_deploy_api=debug,tower_http=debug")
        }))
        .init();

    let config = GatewayConfig::from_env()?;

    // Clients connect on first use; nothing here reaches a backend.
    let registry = bootstrap::build_registry(&config)?;
    if registry.is_empty() {
        tracing::warn!("no adapters configured; every adapter route will answer 404");
    }

    let state = AppState {
        registry: Arc::new(registry),
        request_timeout: config.request_timeout(),
    };

    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    tracing::info!("wide-deploy-api listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
