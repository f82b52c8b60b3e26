//! replifs server binary.

use clap::Parser;
use tokio::signal;

use replifs::config::RuntimeConfig;
use replifs::server::Server;

/// Waits for Ctrl+C or SIGTERM so the replica can shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Command line arguments; every flag overrides the matching config key.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
    /// Storage base path
    #[arg(long)]
    base_path: Option<String>,
    /// Raft data path
    #[arg(long)]
    raft_path: Option<String>,
    /// Raft group id
    #[arg(long)]
    group_id: Option<String>,
    /// Consensus peer address (ip:port or ip:port:index)
    #[arg(long)]
    peer_addr: Option<String>,
    /// Comma-separated initial cluster configuration
    #[arg(long)]
    initial_conf: Option<String>,
    /// Election timeout in milliseconds
    #[arg(long)]
    election_timeout_ms: Option<u64>,
    /// Snapshot interval in seconds
    #[arg(long)]
    snapshot_interval_s: Option<u64>,
    /// RPC bind address
    #[arg(long)]
    rpc_addr: Option<String>,
    /// RPC bind port
    #[arg(long)]
    rpc_port: Option<u16>,
    /// Metrics bind address
    #[arg(long)]
    metrics_addr: Option<String>,
}

fn apply_overrides(config: &mut RuntimeConfig, args: &Args) {
    if let Some(v) = &args.base_path {
        config.base_path = v.clone();
    }
    if let Some(v) = &args.raft_path {
        config.raft_path = v.clone();
    }
    if let Some(v) = &args.group_id {
        config.group_id = v.clone();
    }
    if let Some(v) = &args.peer_addr {
        config.peer_addr = v.clone();
    }
    if let Some(v) = &args.initial_conf {
        config.initial_conf = v.clone();
    }
    if let Some(v) = args.election_timeout_ms {
        config.election_timeout_ms = v;
    }
    if let Some(v) = args.snapshot_interval_s {
        config.snapshot_interval_s = v;
    }
    if let Some(v) = &args.rpc_addr {
        config.rpc_addr = v.clone();
    }
    if let Some(v) = args.rpc_port {
        config.rpc_port = v;
    }
    if let Some(v) = &args.metrics_addr {
        config.metrics_addr = v.clone();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_toml(path)?,
        None => RuntimeConfig::default(),
    };
    apply_overrides(&mut config, &args);
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let server = Server::start(&config).await?;
    log::info!("press Ctrl+C to stop");
    shutdown_signal().await;
    server.stop().await;
    Ok(())
}
