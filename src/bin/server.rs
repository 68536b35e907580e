use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infold_proxy::fingerprint::SandboxDeviceIdProvider;
use infold_proxy::registry::ClientRegistry;
use infold_proxy::server::{AppState, ServerConfig, build_app};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.env_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let provider = Arc::new(SandboxDeviceIdProvider::new(
        config.fingerprint_script.clone(),
    ));
    let registry = Arc::new(ClientRegistry::new(provider, config.api_base.clone()));
    let state = AppState::new(registry).context("Failed to build proxy state")?;

    let app = build_app(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!(
        "Proxy server listening on {} (upstream {})",
        addr,
        config.api_base
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}
