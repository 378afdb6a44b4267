//! Process confinement primitives
//!
//! Everything here is applied to each toolchain/program process the runner
//! spawns:
//! - `identity` - non-root uid/gid and capability checks
//! - `rlimits` - address space, CPU, file size and core dump limits
//! - `seccomp` - syscall denylist built with seccompiler
//! - `landlock` - filesystem access control
//! - `cgroups` - cgroup v2 leaves for memory/pids limits and OOM evidence

pub mod cgroups;
pub mod identity;
pub mod landlock;
pub mod rlimits;
pub mod seccomp;

pub use self::cgroups::{CgroupHandle, CgroupUsage, CgroupsConfig};
pub use self::identity::SpawnIdentity;
pub use self::landlock::LandlockConfig;
pub use self::rlimits::RlimitSet;

use seccompiler::BpfProgram;
use std::sync::{Arc, Mutex};

use crate::Result;

/// Restrictions installed in one child between `fork` and `exec`
#[derive(Debug, Clone)]
pub struct ChildConfinement {
    pub identity: SpawnIdentity,
    pub rlimits: RlimitSet,
    pub seccomp: Option<Arc<BpfProgram>>,
    pub landlock: Option<LandlockConfig>,
}

impl ChildConfinement {
    /// Configure `cmd` so the spawned process starts confined
    ///
    /// The child always leads a new process group so the whole tree can be
    /// killed with one `killpg`.
    pub fn apply(self, cmd: &mut tokio::process::Command) -> Result<()> {
        self.identity.apply(cmd);
        cmd.process_group(0);

        // Opened in the parent: path lookups are not async-signal-safe
        let ruleset = match &self.landlock {
            Some(config) => Some(config.prepare()?),
            None => None,
        };
        let ruleset = Mutex::new(ruleset);
        let rlimits = self.rlimits;
        let seccomp = self.seccomp;

        // SAFETY: the closure only issues setrlimit, prctl, landlock and
        // seccomp syscalls on state prepared before fork
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || {
                rlimits.apply()?;

                let pending = ruleset
                    .lock()
                    .map_err(|_| std::io::Error::other("landlock ruleset poisoned"))?
                    .take();
                if let Some(created) = pending {
                    self::landlock::restrict(created)?;
                }

                if let Some(program) = &seccomp {
                    self::seccomp::install(program)?;
                }
                Ok(())
            });
        }

        Ok(())
    }
}
