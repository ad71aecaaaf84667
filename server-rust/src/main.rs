mod models;
mod routes;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshwork-relay", about = "meshwork relay node: peer directory and signaling mailbox")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "7434", env = "MESHWORK_PORT")]
    port: u16,

    /// Host name peers use to reach this relay
    #[arg(long, default_value = "127.0.0.1", env = "MESHWORK_PUBLIC_HOST")]
    public_host: String,

    /// Auth token (open relay when omitted)
    #[arg(long, env = "MESHWORK_TOKEN")]
    token: Option<String>,

    /// Seconds without a poll before a peer is forgotten
    #[arg(long, default_value = "120", env = "MESHWORK_PEER_TIMEOUT")]
    peer_timeout: u64,

    /// Seconds between prune sweeps
    #[arg(long, default_value = "30", env = "MESHWORK_PRUNE_INTERVAL")]
    prune_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let state = Arc::new(
        state::RelayState::new(&cli.public_host, cli.port, cli.token)
            .context("Failed to derive relay node uuid")?,
    );
    tracing::info!(
        port = cli.port,
        host = %cli.public_host,
        node = %state.node_uuid,
        "Starting meshwork relay"
    );

    let timeout = chrono::Duration::seconds(cli.peer_timeout as i64);
    let prune_every = Duration::from_secs(cli.prune_interval.max(1));
    let pruner = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(prune_every);
        loop {
            tick.tick().await;
            let pruned = pruner.prune(chrono::Utc::now(), timeout).await;
            if !pruned.is_empty() {
                tracing::info!(count = pruned.len(), "Pruned stale peers");
            }
        }
    });

    let app = routes::create_router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
