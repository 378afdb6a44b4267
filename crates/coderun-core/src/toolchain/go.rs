use std::path::PathBuf;

use super::{MemoryEnforcement, Toolchain, ToolchainContext};
use crate::process::CommandSpec;
use crate::submission::Language;

/// Go runtime mappings beyond the heap: arenas, stacks, GC metadata
const RUNTIME_HEADROOM: u64 = 768 * 1024 * 1024;

/// Printed by the runtime itself; plain ENOMEM text can come from any error
const OOM_MARKER: &str = "fatal error: runtime: out of memory";

/// `go build` into a static binary, then run it
///
/// Module proxy and VCS stamping are off; the build cache lives in the
/// workspace so nothing is shared between submissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoToolchain;

impl Toolchain for GoToolchain {
    fn language(&self) -> Language {
        Language::Go
    }

    fn source_file(&self) -> &'static str {
        "main.go"
    }

    fn compile(&self, ctx: &ToolchainContext<'_>) -> Option<CommandSpec> {
        Some(
            ctx.command("go")
                .args(["build", "-o", "main", self.source_file()])
                .envs([
                    ("GOCACHE", ctx.in_workspace(".cache/go-build")),
                    ("GOPATH", ctx.in_workspace(".gopath")),
                    ("GOTMPDIR", ctx.tmp.display().to_string()),
                    ("CGO_ENABLED", "0".to_string()),
                    ("GOTOOLCHAIN", "local".to_string()),
                    ("GOFLAGS", "-buildvcs=false".to_string()),
                    ("GOPROXY", "off".to_string()),
                ]),
        )
    }

    fn run(&self, ctx: &ToolchainContext<'_>) -> CommandSpec {
        ctx.command("./main")
            .env("GOMEMLIMIT", ctx.memory_limit.to_string())
    }

    fn memory_enforcement(&self) -> MemoryEnforcement {
        MemoryEnforcement::AddressSpace {
            headroom: RUNTIME_HEADROOM,
        }
    }

    fn is_out_of_memory(&self, stderr: &str) -> bool {
        stderr.contains(OOM_MARKER)
    }

    fn ro_paths(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("/usr/local/go"), PathBuf::from("/proc")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::tests::{context, env_value};
    use std::path::Path;

    #[test]
    fn build_stays_inside_workspace() {
        let ws = Path::new("/sandbox/abc");
        let tmp = ws.join("tmp");
        let source = ws.join("main.go");
        let ctx = context(ws, &source, &tmp);
        let spec = GoToolchain.compile(&ctx).unwrap();

        assert_eq!(spec.program, "go");
        assert_eq!(spec.args, ["build", "-o", "main", "main.go"]);
        assert_eq!(env_value(&spec, "GOCACHE"), Some("/sandbox/abc/.cache/go-build"));
        assert_eq!(env_value(&spec, "GOPROXY"), Some("off"));
        assert_eq!(env_value(&spec, "CGO_ENABLED"), Some("0"));
    }

    #[test]
    fn run_sets_soft_memory_limit() {
        let ws = Path::new("/sandbox/abc");
        let tmp = ws.join("tmp");
        let source = ws.join("main.go");
        let ctx = context(ws, &source, &tmp);
        let spec = GoToolchain.run(&ctx);

        assert_eq!(spec.program, "./main");
        assert_eq!(env_value(&spec, "GOMEMLIMIT"), Some("268435456"));
    }

    #[test]
    fn recognizes_runtime_oom() {
        assert!(GoToolchain.is_out_of_memory("fatal error: runtime: out of memory\n\ngoroutine 1"));
        assert!(!GoToolchain.is_out_of_memory("panic: index out of range"));
        assert!(!GoToolchain.is_out_of_memory(
            "open data.bin: cannot allocate memory\nexit status 1"
        ));
    }
}
