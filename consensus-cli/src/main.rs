//! consensus - run a leader election and work only while leader.
//!
//! Commands:
//! - `consensus file [--path <file>]`: elect through a locked local lease file
//! - `consensus kubernetes [--lease-name <name>]`: elect through a Kubernetes Lease
//!
//! Environment variables:
//! - INSTANCE_ID: identity of this instance
//! - POD_NAME: identity fallback inside Kubernetes
//! - POD_NAMESPACE: namespace of the Lease object (default: "default")
//! - RUST_LOG: log filter (default: info)
//!
//! Exit codes:
//! - 0: Success
//! - 1: Error
//!
//! Ctrl-C and SIGTERM stop the election and release the lease before exit.

mod cli;

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use consensus::backends::file::FileBackend;
use consensus::backends::kubernetes::KubernetesBackend;
use consensus::{Lease, Manager};

use cli::{Cli, Commands};

/// Pause between rounds of leader-only work
const WORK_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("consensus=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> consensus::Result<()> {
    let config = cli.config();

    let manager = match &cli.command {
        Commands::File { path } => {
            info!(identity = %config.identity, path = %path.display(), "starting leader election");
            Manager::new(FileBackend::new(path), config)?
        }
        Commands::Kubernetes { lease_name } => {
            info!(identity = %config.identity, lease = %lease_name, "starting leader election");
            Manager::new(KubernetesBackend::from_env(lease_name).await?, config)?
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match shutdown_signal().await {
                Ok(signal) => {
                    info!(%signal, "received shutdown signal");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
            }
        }
    });

    let lease = manager.start(cancel.clone());
    work_loop(&lease, &cancel).await;

    manager.shutdown().await;
    info!("shut down");
    Ok(())
}

/// Wait for Ctrl-C or, on Unix, SIGTERM (what Kubernetes sends on pod stop)
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl-C")
}

/// Do placeholder work while leader until `cancel` fires
async fn work_loop(lease: &Lease, cancel: &CancellationToken) {
    let identity = lease.identity();

    loop {
        if !lease.is_leader() {
            info!(%identity, "waiting to become leader");
            if lease.wait_for_leadership(cancel).await.is_err() {
                return;
            }
            continue;
        }

        info!(%identity, "leader: processing jobs");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(WORK_INTERVAL) => {}
        }
    }
}
