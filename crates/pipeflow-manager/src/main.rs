//! pipeflow Manager

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pipeflow_core::Rank;
use pipeflow_manager::{DirRegistry, Manager, ManagerConfig};
use pipeflow_transport::{ClusterConfig, TcpTransport};

#[derive(Parser, Debug)]
#[command(name = "pipeflow-manager", version, about = "Schedule pipeline runs on pipeflow workers")]
struct Args {
    /// Total number of processes in the cluster, manager included.
    #[arg(long, env = "PIPEFLOW_SIZE")]
    size: usize,

    /// Address to listen on for workers.
    #[arg(long, env = "PIPEFLOW_RENDEZVOUS", default_value = "127.0.0.1:7070")]
    rendezvous: SocketAddr,

    /// Spool directory holding pipelines, runs and their statuses.
    #[arg(long, env = "PIPEFLOW_REGISTRY_DIR", default_value = "./pipeflow-registry")]
    registry_dir: PathBuf,

    /// How often to look for new runs and stop requests (milliseconds).
    #[arg(long, default_value_t = 200)]
    poll_interval_ms: u64,

    /// Silence after which a worker is presumed dead (seconds).
    #[arg(long, default_value_t = 45)]
    heartbeat_timeout_secs: u64,

    /// Grace period given to busy workers on shutdown (seconds).
    #[arg(long, default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// How long past the grace period to wait for final reports (seconds).
    #[arg(long, default_value_t = 15)]
    shutdown_margin_secs: u64,

    /// Write a Prometheus textfile snapshot here after each poll.
    #[arg(long)]
    metrics_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let args = Args::parse();

    let config = ManagerConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        shutdown_margin: Duration::from_secs(args.shutdown_margin_secs),
        metrics_path: args.metrics_path,
        ..ManagerConfig::default()
    };

    let registry = Arc::new(DirRegistry::open(&args.registry_dir).await?);
    let cluster = ClusterConfig::new(Rank::MANAGER, args.size, args.rendezvous);
    let transport = Arc::new(TcpTransport::listen(&cluster).await?);

    info!(
        rendezvous = %transport.local_addr(),
        size = args.size,
        registry = %registry.root().display(),
        "Starting pipeflow manager"
    );

    let mut manager = Manager::new(config, transport, registry.clone(), registry)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    if let Err(e) = manager.run(shutdown).await {
        error!(error = %e, "Manager stopped");
        std::process::exit(1);
    }

    info!("Manager stopped");
    Ok(())
}
