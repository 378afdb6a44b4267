//! coderun-daemon - Unix-socket server over a fixed pool of runner slots
//!
//! Clients send length-prefixed JSON requests (see
//! `coderun_core::protocol`). SIGTERM or SIGINT stops accepting
//! connections, waits for in-flight submissions, and removes the socket.

use anyhow::{Context, Result};
use coderun_core::{Runner, workspace};
use futures_util::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;

mod config;
mod pool;
mod server;

use config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("coderun=info".parse()?))
        .init();

    tracing::info!("coderun-daemon starting");

    // Load config
    let config = DaemonConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        workers = config.workers,
        socket = ?config.socket_path,
        "configuration loaded"
    );

    let runner = Runner::new(config.policy.clone()).context("runner refused to start")?;
    let swept = workspace::sweep_stale(&config.policy.workspace_root, Duration::ZERO)?;
    tracing::info!(swept, "workspace root ready");

    // Create socket directory if needed
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove existing socket
    let _ = std::fs::remove_file(&config.socket_path);

    // Bind socket
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o660))?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let pool = Arc::new(pool::WorkerPool::new(runner, config.workers));
    tracing::info!(workers = config.workers, "worker pool initialized");

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let signals_handle = signals.handle();

    tokio::select! {
        result = server::run(listener, Arc::clone(&pool)) => {
            result.context("server stopped")?;
        }
        Some(signal) = signals.next() => {
            tracing::info!(signal, "shutdown requested");
        }
    }
    signals_handle.close();

    if pool.drain(config.drain_timeout).await {
        tracing::info!("all submissions finished");
    } else {
        tracing::warn!(timeout = ?config.drain_timeout, "in-flight submissions abandoned");
    }

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(error = %e, "failed to remove socket");
    }
    tracing::info!("coderun-daemon stopped");
    Ok(())
}
