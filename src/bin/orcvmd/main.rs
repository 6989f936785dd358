//! orcvmd: the worker daemon. Resolves configuration, bootstraps the worker
//! core, and runs until SIGTERM/SIGINT, draining in-flight task handlers
//! before exit.

use std::sync::Arc;

use orcvm::admin;
use orcvm::cancel::CancelToken;
use orcvm::config::Config;
use orcvm::worker_core::WorkerCore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    let core = match WorkerCore::bootstrap(config).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to bootstrap worker");
            return std::process::ExitCode::FAILURE;
        }
    };

    info!(worker_id = %core.worker_id, "orcvmd started");

    let shutdown = CancelToken::new();
    spawn_signal_handler(shutdown.clone());

    let admin_socket = core.config.worker.admin_socket_path.clone();
    let admin_task = tokio::spawn(admin::serve(core.clone(), admin_socket, shutdown.clone()));

    core.run(shutdown).await;
    admin_task.abort();
    info!("orcvmd shut down cleanly");
    std::process::ExitCode::SUCCESS
}

fn spawn_signal_handler(shutdown: CancelToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal_hook_tokio_sigterm() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
        shutdown.cancel();
    });
}

fn signal_hook_tokio_sigterm() -> std::io::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
}
