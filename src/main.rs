use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simplestream_mirror::{build_router, AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simplestream_mirror=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let bind_addr = config.bind_addr;
    tracing::info!("Artifact root: {:?}", config.artifact_root);
    tracing::info!("Publish root: {:?}", config.publish_root);

    let state = match AppState::build(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!("Failed to start: {}", e);
            return Err(e.into());
        }
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Listening on http://{}", bind_addr);
    tracing::info!("Simplestream index: http://{}/streams/v1/index.json", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
