//! Kernel resource limits for a single child

use nix::sys::resource::{Resource, setrlimit};
use std::time::Duration;

/// Limits installed with `setrlimit` before exec
///
/// `None` leaves the inherited limit in place. Core dumps are always
/// disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitSet {
    /// RLIMIT_AS in bytes
    pub address_space: Option<u64>,
    /// RLIMIT_CPU in whole seconds
    pub cpu_seconds: Option<u64>,
    /// RLIMIT_FSIZE in bytes
    pub file_size: Option<u64>,
}

impl RlimitSet {
    #[must_use]
    pub const fn address_space(mut self, bytes: u64) -> Self {
        self.address_space = Some(bytes);
        self
    }

    /// CPU ceiling a program running `threads` busy threads for all of
    /// `wall` stays under
    ///
    /// `RLIMIT_CPU` counts every thread of the process, so the backstop only
    /// fires after the wall-clock timer should already have.
    #[must_use]
    pub const fn cpu_for(mut self, wall: Duration, threads: u64) -> Self {
        let secs = wall.as_secs() + if wall.subsec_nanos() > 0 { 1 } else { 0 };
        let threads = if threads == 0 { 1 } else { threads };
        self.cpu_seconds = Some(secs.saturating_mul(threads).saturating_add(1));
        self
    }

    #[must_use]
    pub const fn file_size(mut self, bytes: u64) -> Self {
        self.file_size = Some(bytes);
        self
    }

    /// Install the limits in the calling process
    ///
    /// Only issues `setrlimit`, so it is safe between fork and exec.
    pub fn apply(&self) -> std::io::Result<()> {
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(secs) = self.cpu_seconds {
            // Soft limit raises SIGXCPU; the hard limit one second later is SIGKILL
            setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)?;
        }
        if let Some(bytes) = self.file_size {
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}
