use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::config::Config;
use warden::engine::{spawn_enroll_listener, Supervisor};
use warden::notifications::Notifier;
use warden::runtime::{ContainerRuntime, DockerRuntime};
use warden::store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about = "An autonomous self-healing container supervisor", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Override the container runtime socket
    #[arg(long, env = "WARDEN_DOCKER_SOCKET")]
    docker_socket: Option<String>,

    /// Override the state directory
    #[arg(long, env = "WARDEN_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config)?;
    if let Some(socket) = cli.docker_socket {
        config.runtime.docker_socket = socket;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    // Logging: CLI flag beats config file beats RUST_LOG.
    let log_level = cli
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Warden v{}", env!("CARGO_PKG_VERSION"));

    // A data directory we can't create or write to is fatal.
    warden::utils::ensure_dir(&config.storage.data_dir)?;
    let store = Arc::new(
        StateStore::load(&config.storage.data_dir)
            .context("Failed to initialize the state store")?,
    );

    // So is a missing container runtime.
    let docker = DockerRuntime::new(&config.runtime.docker_socket)
        .context("Failed to connect to the container runtime")?;
    docker
        .ping()
        .await
        .context("Container runtime is not reachable")?;
    tracing::info!(socket = %config.runtime.docker_socket, "Connected to container runtime");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let notifier = Notifier::spawn(store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Auto-enroll listener runs independently of the tick driver.
    let enroll_task = spawn_enroll_listener(
        runtime.clone(),
        store.clone(),
        notifier.clone(),
        shutdown_rx.clone(),
    );

    let supervisor = Arc::new(Supervisor::new(runtime, store.clone(), notifier));
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    wait_for_stop_signal().await;
    tracing::info!("Stop requested, draining workers");
    let _ = shutdown_tx.send(true);

    // In-flight workers finish within the current tick; then flush state.
    let _ = supervisor_task.await;
    let _ = enroll_task.await;
    store.flush_all().context("Final state flush failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait until the process is asked to stop (SIGINT, and SIGTERM on unix).
async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
