//! # coderun-core
//!
//! Confined execution of untrusted submissions.
//!
//! A [`Runner`] takes one [`Submission`], materializes it in a fresh
//! [`workspace::Workspace`], compiles and runs it through a
//! [`toolchain::Toolchain`] under the restrictions of a
//! [`ConfinementPolicy`], and always hands back exactly one
//! [`ExecutionResult`]:
//! - one process group per spawned toolchain/program, killed as a whole
//! - non-root identity, cleared environment, rlimits
//! - seccomp denylist and Landlock filesystem rules
//! - optional cgroup v2 memory/pids accounting

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod isolation;
pub mod process;
pub mod protocol;
pub mod result;
pub mod runner;
pub mod submission;
pub mod toolchain;
pub mod workspace;

pub use config::ConfinementPolicy;
pub use error::CoderunError;
pub use result::{ExecutionResult, GradeReport, TerminationReason};
pub use runner::Runner;
pub use submission::{Language, Limits, Submission, TestCase};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, CoderunError>;
