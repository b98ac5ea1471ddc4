//! PayGuard server
//!
//! Loads configuration from the environment, wires the governance pipeline,
//! spawns the payment poll loop, and serves the webhook + admin surface.

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use payguard_ingress::{routes, state, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (app_state, poll) = state::build(&config, shutdown_rx).await?;

    let poll_handle = if config.auto_poll {
        Some(tokio::spawn(poll.run()))
    } else {
        tracing::info!("auto-poll disabled, pull mode off");
        None
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "payguard server listening");

    axum::serve(listener, routes::router(app_state))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    if let Some(handle) = poll_handle {
        // The watch channel already flipped; give the loop a moment to drain.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }
    tracing::info!("payguard server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
