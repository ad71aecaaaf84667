mod client;
mod config;
mod coordinator;
mod executor;
mod pool;
mod server;
mod storage;
mod transport;
mod unit;

use anyhow::{Context, Result};
use clap::Parser;
use meshwork_protocol::{GossipNode, LocalPeer, Location, MeshSettings, RelayNode};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshwork-worker", about = "meshwork volunteer compute peer")]
struct Cli {
    /// Peer uuid (random when omitted)
    #[arg(long, env = "MESHWORK_PEER_ID")]
    peer_id: Option<String>,

    /// Latitude of this peer
    #[arg(long, env = "MESHWORK_LAT", default_value = "0")]
    lat: f64,

    /// Longitude of this peer
    #[arg(long, env = "MESHWORK_LONG", default_value = "0")]
    long: f64,

    /// Address the gossip server listens on
    #[arg(long, env = "MESHWORK_LISTEN", default_value = "0.0.0.0:7435")]
    listen: String,

    /// Gossip endpoint advertised to peers (repeatable, preferred first)
    #[arg(long = "endpoint", env = "MESHWORK_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Relay node as host:port (repeatable)
    #[arg(long = "relay", env = "MESHWORK_RELAYS", value_delimiter = ',')]
    relays: Vec<String>,

    /// Shared auth token for relays and peers
    #[arg(long, env = "MESHWORK_TOKEN")]
    token: Option<String>,

    /// Directory for persisted results
    #[arg(long, env = "MESHWORK_DATA_DIR", default_value = "./worker-data")]
    data_dir: PathBuf,

    /// Directory job input files are read from
    #[arg(long, env = "MESHWORK_FILES_DIR", default_value = "./files")]
    files_dir: PathBuf,

    /// Scratch directory for running jobs
    #[arg(long, env = "MESHWORK_WORK_DIR", default_value = "./work")]
    work_dir: PathBuf,

    /// Program that executes a job
    #[arg(long, env = "MESHWORK_PROGRAM")]
    program: String,

    /// Extra argument for the job program (repeatable)
    #[arg(long = "program-arg")]
    program_args: Vec<String>,

    /// Job timeout in seconds
    #[arg(long, env = "MESHWORK_JOB_TIMEOUT", default_value = "3600")]
    job_timeout: u64,

    /// Relay poll interval in seconds
    #[arg(long, env = "MESHWORK_POLL_INTERVAL", default_value = "5")]
    poll_interval: u64,

    /// Mesh settings as JSON
    #[arg(long, env = "MESHWORK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of execution units
    #[arg(long, env = "MESHWORK_MAX_WORKERS")]
    max_workers: Option<usize>,
}

async fn load_settings(path: Option<&PathBuf>) -> Result<MeshSettings> {
    let Some(path) = path else {
        return Ok(MeshSettings::default());
    };
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Invalid settings in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut mesh = load_settings(cli.config.as_ref()).await?;
    if let Some(n) = cli.max_workers {
        mesh.max_workers = n;
    }
    let cfg = config::Config {
        peer_id: cli.peer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        location: Location {
            lat: cli.lat,
            long: cli.long,
        },
        endpoints: if cli.endpoints.is_empty() {
            vec![format!("http://{}", cli.listen)]
        } else {
            cli.endpoints
        },
        listen_addr: cli.listen,
        relays: cli.relays,
        auth_token: cli.token,
        data_dir: cli.data_dir,
        files_dir: cli.files_dir,
        work_dir: cli.work_dir,
        program: cli.program,
        program_args: cli.program_args,
        job_timeout_secs: cli.job_timeout,
        poll_interval_secs: cli.poll_interval,
        mesh,
    };

    tracing::info!(
        peer = %cfg.peer_id,
        workers = cfg.mesh.max_workers,
        relays = cfg.relays.len(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting meshwork worker"
    );

    let store = Arc::new(
        storage::JsonFileStore::open(&cfg.data_dir)
            .await
            .context("Failed to open data directory")?,
    );
    let network_timeout = Duration::from_secs(10);
    let transport = Arc::new(transport::HttpTransport::new(cfg.auth_token.clone(), network_timeout)?);
    let relays = Arc::new(client::RelayClient::new(cfg.auth_token.clone(), network_timeout)?);

    let node = Arc::new(GossipNode::new(
        LocalPeer {
            uuid: cfg.peer_id.clone(),
            location: cfg.location,
            endpoints: cfg.endpoints.clone(),
        },
        cfg.mesh.clone(),
        store,
        transport,
        relays.clone(),
    ));
    node.start().await.context("Failed to load stored results")?;

    for addr in &cfg.relays {
        match config::parse_relay(addr) {
            Some((host, port)) => node.add_node(RelayNode::new(host, port)?).await,
            None => tracing::warn!(relay = %addr, "Ignoring malformed relay address"),
        }
    }

    let executor = Arc::new(executor::ProcessExecutor::new(
        cfg.program.clone(),
        cfg.program_args.clone(),
        cfg.work_dir.clone(),
        Duration::from_secs(cfg.job_timeout_secs),
    ));
    let (pool, events) = pool::WorkerPool::new(cfg.mesh.max_workers, cfg.peer_id.clone(), executor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let state = Arc::new(server::WorkerState {
        node: node.clone(),
        auth_token: cfg.auth_token.clone(),
        started_at: chrono::Utc::now(),
    });
    let app = server::create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
    tracing::info!("Gossip server listening on {}", cfg.listen_addr);
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for(shutdown_rx.clone()))
            .into_future(),
    );

    let coordinator = coordinator::Coordinator::new(
        node,
        pool,
        events,
        relays,
        cfg.files_dir.clone(),
        Duration::from_secs(cfg.poll_interval_secs),
    );
    coordinator.run(wait_for(shutdown_rx)).await?;

    server.await??;
    tracing::info!("Worker shut down");
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
