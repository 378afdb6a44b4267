//! Error types for coderun-core
//!
//! These never reach a submitter directly: the runner turns every one of
//! them into an `internal_error` result.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoderunError {
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("toolchain unavailable: {0}")]
    Toolchain(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("landlock error: {0}")]
    Landlock(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
