use std::path::PathBuf;

use super::{MemoryEnforcement, Toolchain, ToolchainContext};
use crate::process::CommandSpec;
use crate::submission::Language;

const OOM_MARKERS: &[&str] = &["JavaScript heap out of memory", "Fatal process out of memory"];

/// `node --check`, then node with its old-space heap capped at the limit
///
/// V8 reserves far more address space than it uses, so the limit is
/// enforced through the heap flag rather than `RLIMIT_AS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JavaScriptToolchain;

impl Toolchain for JavaScriptToolchain {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn source_file(&self) -> &'static str {
        "main.js"
    }

    fn compile(&self, ctx: &ToolchainContext<'_>) -> Option<CommandSpec> {
        Some(ctx.command("node").args(["--check", self.source_file()]))
    }

    fn run(&self, ctx: &ToolchainContext<'_>) -> CommandSpec {
        let heap_mb = (ctx.memory_limit / (1024 * 1024)).max(16);
        ctx.command("node")
            .arg(format!("--max-old-space-size={heap_mb}"))
            .arg(self.source_file())
    }

    fn memory_enforcement(&self) -> MemoryEnforcement {
        MemoryEnforcement::Runtime
    }

    fn is_out_of_memory(&self, stderr: &str) -> bool {
        OOM_MARKERS.iter().any(|m| stderr.contains(m))
    }

    fn ro_paths(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("/proc")]
    }
}
