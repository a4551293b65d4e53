//! pipeflow Worker Daemon

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pipeflow_core::Rank;
use pipeflow_transport::{ClusterConfig, TcpTransport};
use pipeflow_worker::{ProcessEngine, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "pipeflow-worker", version, about = "Execute pipeflow task units")]
struct Args {
    /// This worker's rank, 1 or above.
    #[arg(long, env = "PIPEFLOW_RANK")]
    rank: u32,

    /// Total number of processes in the cluster, manager included.
    #[arg(long, env = "PIPEFLOW_SIZE")]
    size: usize,

    /// Address the manager listens on.
    #[arg(long, env = "PIPEFLOW_RENDEZVOUS", default_value = "127.0.0.1:7070")]
    rendezvous: SocketAddr,

    /// Program started for every step; receives the step id as last argument.
    #[arg(long, env = "PIPEFLOW_STEP_PROGRAM")]
    program: String,

    /// Arguments passed to the program before the step id.
    #[arg(long = "program-arg")]
    program_args: Vec<String>,

    /// Root directory of run datasets.
    #[arg(long, env = "PIPEFLOW_DATA_DIR", default_value = "./pipeflow-data")]
    data_dir: PathBuf,

    /// Heartbeat interval (seconds).
    #[arg(long, default_value_t = 15)]
    heartbeat_interval_secs: u64,

    /// How often a busy worker checks for cancellation (milliseconds).
    #[arg(long, default_value_t = 250)]
    cancel_poll_ms: u64,

    /// Attempts to reach the manager before giving up.
    #[arg(long, default_value_t = 30)]
    connect_attempts: u32,

    /// Delay between connection attempts (seconds).
    #[arg(long, default_value_t = 1)]
    connect_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let args = Args::parse();

    let config = WorkerConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        cancel_poll_interval: Duration::from_millis(args.cancel_poll_ms),
        ..WorkerConfig::default()
    };

    let cluster = ClusterConfig::new(Rank::new(args.rank), args.size, args.rendezvous);
    info!(
        rank = args.rank,
        manager = %args.rendezvous,
        hostname = %config.hostname,
        "Starting pipeflow worker"
    );

    let transport = match TcpTransport::connect(
        &cluster,
        args.connect_attempts,
        Duration::from_secs(args.connect_delay_secs),
    )
    .await
    {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!(error = %e, "Failed to reach the manager");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(ProcessEngine::new(args.program, args.data_dir).with_args(args.program_args));
    let worker = Worker::new(config, transport, engine)?;

    if let Err(e) = worker.main_procedure().await {
        error!(error = %e, "Worker stopped");
        std::process::exit(1);
    }

    info!("Worker stopped");
    Ok(())
}
