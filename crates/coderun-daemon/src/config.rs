//! Daemon configuration

use coderun_core::config::default_socket_path;
use coderun_core::{CoderunError, ConfinementPolicy, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the daemon
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// Number of runner slots, i.e. submissions executed at once
    pub workers: usize,

    /// How long shutdown waits for in-flight submissions
    pub drain_timeout: Duration,

    /// Confinement every slot runs under
    pub policy: ConfinementPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            workers: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            drain_timeout: Duration::from_secs(30),
            policy: ConfinementPolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Read `CODERUN_WORKERS`, `CODERUN_DRAIN_TIMEOUT_MS` and the policy
    /// variables from the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            policy: ConfinementPolicy::from_lookup(&lookup)?,
            ..Self::default()
        };

        if let Some(workers) = lookup("CODERUN_WORKERS") {
            config.workers = workers
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| CoderunError::Config(format!("invalid worker count: {workers}")))?;
        }

        if let Some(ms) = lookup("CODERUN_DRAIN_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| CoderunError::Config(format!("invalid drain timeout: {ms}")))?;
            config.drain_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}
