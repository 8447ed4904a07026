//! outpostd - the outpost supervisor daemon.
//!
//! Long-lived supervisor for on-device components: serves the local IPC
//! control plane, serializes deployments through a single lane, and
//! resumes bootstrap-requiring deployments across restarts. Returns 0 on
//! clean shutdown and non-zero on unrecoverable startup failure;
//! deployment failures never terminate the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use outpost_core::deployment::{DeploymentDirectoryManager, GroupRootsStore};
use outpost_core::store::ComponentStore;
use outpost_core::supervisor::Supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use outpost_daemon::ipc_server;
use outpost_daemon::launcher::ExecLauncher;
use outpost_daemon::orchestrator::DeploymentLane;
use outpost_daemon::state::{DaemonStateHandle, SharedState};

/// outpostd - on-device component orchestrator
#[derive(Parser, Debug)]
#[command(name = "outpostd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Supervisor root directory
    #[arg(short, long, default_value = "/var/lib/outpost")]
    root: PathBuf,

    /// Path to the control-plane Unix socket (default: <root>/outpostd.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Wall-clock budget per deployment
    #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
    deployment_timeout: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let state = build_state(&args).context("daemon startup failed")?;
    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| args.root.join("outpostd.sock"));

    info!(
        root = %args.root.display(),
        socket = %socket_path.display(),
        "outpostd started (pid: {})",
        std::process::id()
    );

    // the lane resumes persisted deployments before serving the queue
    let lane = DeploymentLane::new(state.clone(), args.deployment_timeout);
    let queue = lane.queue.clone();
    let lane_task = tokio::spawn(lane.run());

    let ipc_state = state.clone();
    let ipc_socket = socket_path.clone();
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc_server::run(&ipc_socket, ipc_state, queue).await {
            error!("IPC server error: {e}");
        }
    });

    let signal_state = state.clone();
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_state.request_shutdown();
    });

    tokio::select! {
        _ = ipc_task => info!("IPC server exited"),
        _ = signal_task => info!("signal handler triggered shutdown"),
    }

    info!("shutting down outpostd...");
    state.request_shutdown();
    if let Err(e) = lane_task.await {
        warn!("deployment lane task failed: {e}");
    }
    shutdown_all_services(&state).await;

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    info!("outpostd shutdown complete");
    Ok(())
}

/// Open every persisted store under the root. A corrupt group-roots file
/// refuses startup until the operator intervenes.
fn build_state(args: &Args) -> Result<SharedState> {
    std::fs::create_dir_all(&args.root)
        .with_context(|| format!("creating root directory {}", args.root.display()))?;

    let store = ComponentStore::open(&args.root).context("opening component store")?;
    let groups = GroupRootsStore::load(&args.root).context("loading persisted group roots")?;
    let directories =
        DeploymentDirectoryManager::open(&args.root).context("opening deployments directory")?;
    let supervisor = Supervisor::new(&args.root, Arc::new(ExecLauncher::new()));

    Ok(Arc::new(DaemonStateHandle::new(
        &args.root,
        supervisor,
        groups,
        store,
        directories,
    )))
}

/// Stop every active service before exit.
async fn shutdown_all_services(state: &SharedState) {
    let mut topology = state.topology.write().await;
    let names: Vec<String> = topology
        .supervisor
        .running_versions()
        .into_keys()
        .collect();
    if names.is_empty() {
        info!("no running services to stop");
        return;
    }

    info!("stopping {} running service(s)", names.len());
    let stop_order = topology
        .supervisor
        .stop_order(&names.iter().cloned().collect());
    for name in stop_order {
        if let Err(e) = topology.supervisor.stop_service(&name).await {
            warn!(service = %name, error = %e, "error stopping service");
        }
    }
    info!("all services stopped");
}
