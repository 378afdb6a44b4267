//! Per-language build and run recipes
//!
//! A [`Toolchain`] knows the file name a submission is written to, how to
//! compile it (if the language has a separate check/compile step), how to
//! run the result, and how its runtime reports running out of memory. It
//! only describes commands; spawning them is the runner's job.

mod go;
mod javascript;
mod python;

pub use self::go::GoToolchain;
pub use self::javascript::JavaScriptToolchain;
pub use self::python::PythonToolchain;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process::CommandSpec;
use crate::submission::Language;

/// How a run step's memory limit is enforced besides the optional cgroup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEnforcement {
    /// `RLIMIT_AS` of the limit plus `headroom` for runtime mappings
    AddressSpace { headroom: u64 },
    /// The runtime caps its own heap; no address-space limit
    Runtime,
}

impl MemoryEnforcement {
    /// Address-space ceiling for a run step limited to `memory` bytes
    #[must_use]
    pub const fn address_space(self, memory: u64) -> Option<u64> {
        match self {
            Self::AddressSpace { headroom } => Some(memory.saturating_add(headroom)),
            Self::Runtime => None,
        }
    }
}

/// Paths of one submission, handed to recipes
#[derive(Debug, Clone, Copy)]
pub struct ToolchainContext<'a> {
    pub workspace: &'a Path,
    pub source: &'a Path,
    pub tmp: &'a Path,
    /// `PATH` toolchains are resolved through
    pub search_path: &'a str,
    /// Memory limit of the run step in bytes
    pub memory_limit: u64,
}

impl ToolchainContext<'_> {
    /// `program` in the workspace with the base environment every step gets
    #[must_use]
    pub fn command(&self, program: impl Into<String>) -> CommandSpec {
        CommandSpec::new(program, self.workspace).envs([
            ("PATH", self.search_path.to_string()),
            ("HOME", self.workspace.display().to_string()),
            ("TMPDIR", self.tmp.display().to_string()),
            ("LANG", "C.UTF-8".to_string()),
        ])
    }

    /// Path under the workspace as an argument/variable value
    #[must_use]
    pub fn in_workspace(&self, relative: &str) -> String {
        self.workspace.join(relative).display().to_string()
    }
}

/// Build and run recipe of one language
pub trait Toolchain: fmt::Debug + Send + Sync {
    fn language(&self) -> Language;

    /// File name the source is written to inside the workspace
    fn source_file(&self) -> &'static str;

    /// Compile or syntax-check step; `None` when the language has none
    fn compile(&self, ctx: &ToolchainContext<'_>) -> Option<CommandSpec>;

    fn run(&self, ctx: &ToolchainContext<'_>) -> CommandSpec;

    fn memory_enforcement(&self) -> MemoryEnforcement;

    /// Whether `stderr` carries the runtime's own out-of-memory diagnostic
    fn is_out_of_memory(&self, stderr: &str) -> bool;

    /// Host paths the toolchain needs readable beyond the policy's
    fn ro_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Built-in toolchain for `language`
#[must_use]
pub fn for_language(language: Language) -> Arc<dyn Toolchain> {
    match language {
        Language::Go => Arc::new(GoToolchain),
        Language::Python => Arc::new(PythonToolchain),
        Language::JavaScript => Arc::new(JavaScriptToolchain),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn context<'a>(workspace: &'a Path, source: &'a Path, tmp: &'a Path) -> ToolchainContext<'a> {
        ToolchainContext {
            workspace,
            source,
            tmp,
            search_path: "/usr/bin:/bin",
            memory_limit: 256 * 1024 * 1024,
        }
    }

    pub(crate) fn env_value<'a>(spec: &'a CommandSpec, key: &str) -> Option<&'a str> {
        spec.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn every_language_has_a_toolchain() {
        for language in [Language::Go, Language::Python, Language::JavaScript] {
            assert_eq!(for_language(language).language(), language);
        }
    }

    #[test]
    fn base_environment_points_into_workspace() {
        let ws = Path::new("/sandbox/abc");
        let tmp = ws.join("tmp");
        let source = ws.join("main.go");
        let ctx = context(ws, &source, &tmp);
        let spec = ctx.command("true");

        assert_eq!(spec.current_dir, ws);
        assert_eq!(env_value(&spec, "HOME"), Some("/sandbox/abc"));
        assert_eq!(env_value(&spec, "TMPDIR"), Some("/sandbox/abc/tmp"));
        assert_eq!(env_value(&spec, "PATH"), Some("/usr/bin:/bin"));
    }

    #[test]
    fn address_space_adds_headroom() {
        let mem = MemoryEnforcement::AddressSpace { headroom: 10 };
        assert_eq!(mem.address_space(100), Some(110));
        assert_eq!(MemoryEnforcement::Runtime.address_space(100), None);
    }
}
