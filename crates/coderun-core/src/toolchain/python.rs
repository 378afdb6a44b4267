use super::{MemoryEnforcement, Toolchain, ToolchainContext};
use crate::process::CommandSpec;
use crate::submission::Language;

/// Interpreter and shared library mappings on top of the heap
const RUNTIME_HEADROOM: u64 = 64 * 1024 * 1024;

/// `py_compile` as a syntax check, then the interpreter
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonToolchain;

impl Toolchain for PythonToolchain {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self) -> &'static str {
        "main.py"
    }

    fn compile(&self, ctx: &ToolchainContext<'_>) -> Option<CommandSpec> {
        Some(
            ctx.command("python3")
                .args(["-m", "py_compile", self.source_file()])
                .env("PYTHONPYCACHEPREFIX", ctx.tmp.join("pycache").display().to_string()),
        )
    }

    fn run(&self, ctx: &ToolchainContext<'_>) -> CommandSpec {
        ctx.command("python3")
            .arg(self.source_file())
            .envs([("PYTHONUNBUFFERED", "1"), ("PYTHONDONTWRITEBYTECODE", "1")])
    }

    fn memory_enforcement(&self) -> MemoryEnforcement {
        MemoryEnforcement::AddressSpace {
            headroom: RUNTIME_HEADROOM,
        }
    }

    fn is_out_of_memory(&self, stderr: &str) -> bool {
        stderr.contains("MemoryError")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::tests::{context, env_value};
    use std::path::Path;

    #[test]
    fn bytecode_never_lands_next_to_source() {
        let ws = Path::new("/sandbox/abc");
        let tmp = ws.join("tmp");
        let source = ws.join("main.py");
        let ctx = context(ws, &source, &tmp);

        let check = PythonToolchain.compile(&ctx).unwrap();
        assert_eq!(check.args, ["-m", "py_compile", "main.py"]);
        assert_eq!(env_value(&check, "PYTHONPYCACHEPREFIX"), Some("/sandbox/abc/tmp/pycache"));

        let run = PythonToolchain.run(&ctx);
        assert_eq!(run.args, ["main.py"]);
        assert_eq!(env_value(&run, "PYTHONDONTWRITEBYTECODE"), Some("1"));
    }

    #[test]
    fn memory_error_traceback_is_oom() {
        assert!(PythonToolchain.is_out_of_memory("Traceback (most recent call last):\nMemoryError\n"));
        assert!(!PythonToolchain.is_out_of_memory("ZeroDivisionError: division by zero"));
    }
}
