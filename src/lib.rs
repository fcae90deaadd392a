use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod proxy;
pub mod ratelimit;
pub mod rbac;
pub mod routes;
pub mod utils;

use config::Config;
use context::AppContext;

/// Run the gateway until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let port = config.port;
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);

    let ctx = Arc::new(AppContext::new(config)?);
    let sweeper = ratelimit::spawn_sweeper(ctx.ledger.clone(), sweep_interval);

    let app = routes::create_router(ctx);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    tracing::info!("Gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
