//! Cgroups v2 resource limits
//!
//! Optional second line of memory enforcement. When the runner is given a
//! delegated cgroup v2 directory it creates one leaf per phase, caps memory,
//! CPU bandwidth and process count there, and reads back the kernel's OOM
//! evidence.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CoderunError, Result};

/// Scheduling period of `cpu.max` in microseconds
const CPU_PERIOD_US: u64 = 100_000;

/// Controllers the root delegates to its leaves
const CONTROLLERS: &[&str] = &["memory", "pids", "cpu"];

/// Limits written to a fresh cgroup leaf
#[derive(Debug, Clone)]
pub struct CgroupsConfig {
    /// Delegated parent directory, e.g. `/sys/fs/cgroup/coderun`
    pub root: PathBuf,
    /// Memory limit in bytes (memory.max)
    pub memory_max: u64,
    /// Maximum number of tasks (pids.max)
    pub pids_max: u32,
    /// CPU quota as percentage of one core (cpu.max); 0 is unlimited
    pub cpu_percent: u32,
    /// Enable memory swap (memory.swap.max)
    pub allow_swap: bool,
}

impl CgroupsConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, memory_max: u64, pids_max: u32) -> Self {
        Self {
            root: root.into(),
            memory_max,
            pids_max,
            cpu_percent: 0,
            allow_swap: false,
        }
    }

    #[must_use]
    pub const fn cpu_percent(mut self, percent: u32) -> Self {
        self.cpu_percent = percent;
        self
    }

    /// `cpu.max` line for the configured quota
    #[must_use]
    pub fn cpu_max(&self) -> String {
        if self.cpu_percent == 0 {
            format!("max {CPU_PERIOD_US}")
        } else {
            let quota = CPU_PERIOD_US / 100 * u64::from(self.cpu_percent);
            format!("{quota} {CPU_PERIOD_US}")
        }
    }

    /// Create a leaf named `name` under the root and write its limits
    pub fn create_cgroup(&self, name: &str) -> Result<CgroupHandle> {
        let path = self.root.join(name);
        fs::create_dir(&path).map_err(|e| {
            CoderunError::Cgroup(format!("failed to create {}: {e}", path.display()))
        })?;

        // From here on the handle removes the directory if a write fails
        let handle = CgroupHandle {
            name: name.to_string(),
            path,
            removed: false,
        };

        handle.write("memory.max", &self.memory_max.to_string())?;
        if !self.allow_swap {
            // Absent when swap accounting is off
            if let Err(e) = handle.write("memory.swap.max", "0") {
                tracing::debug!(cgroup = %handle.name, error = %e, "swap limit not set");
            }
        }
        handle.write("pids.max", &self.pids_max.to_string())?;
        if self.cpu_percent > 0 {
            // Absent when the cpu controller is not delegated
            if let Err(e) = handle.write("cpu.max", &self.cpu_max()) {
                tracing::warn!(cgroup = %handle.name, error = %e, "cpu quota not set");
            }
        }

        tracing::debug!(
            cgroup = %handle.name,
            memory = self.memory_max,
            pids = self.pids_max,
            cpu_percent = self.cpu_percent,
            "cgroup created"
        );
        Ok(handle)
    }
}

/// Ask the root to delegate the memory, pids and cpu controllers to its
/// children
///
/// Best effort and one controller at a time: the kernel rejects a whole
/// write if any controller in it is unavailable.
pub fn enable_controllers(root: &Path) {
    let control = root.join("cgroup.subtree_control");
    for controller in CONTROLLERS {
        if let Err(e) = fs::write(&control, format!("+{controller}")) {
            tracing::warn!(path = ?control, controller, error = %e, "could not enable cgroup controller");
        }
    }
}

/// What a leaf recorded about the processes it held
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    pub oom_killed: bool,
    pub memory_peak: Option<u64>,
}

/// Handle to a cgroup leaf; removed on drop
#[derive(Debug)]
pub struct CgroupHandle {
    name: String,
    path: PathBuf,
    removed: bool,
}

impl CgroupHandle {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        // Interface files are created by the kernel; never create one ourselves
        OpenOptions::new()
            .write(true)
            .open(self.path.join(file))
            .and_then(|mut f| f.write_all(value.as_bytes()))
            .map_err(|e| {
                CoderunError::Cgroup(format!("failed to write {file} for {}: {e}", self.name))
            })
    }

    fn read(&self, file: &str) -> Result<String> {
        fs::read_to_string(self.path.join(file)).map_err(|e| {
            CoderunError::Cgroup(format!("failed to read {file} for {}: {e}", self.name))
        })
    }

    /// Move a process into this cgroup
    ///
    /// Children it forks afterwards are accounted here as well.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        tracing::trace!(cgroup = %self.name, pid, "adding process to cgroup");
        self.write("cgroup.procs", &pid.to_string())
    }

    /// Peak memory usage; `None` on kernels without memory.peak
    pub fn memory_peak(&self) -> Result<Option<u64>> {
        match fs::read_to_string(self.path.join("memory.peak")) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| CoderunError::Cgroup(format!("bad memory.peak for {}: {e}", self.name))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoderunError::Cgroup(format!(
                "failed to read memory.peak for {}: {e}",
                self.name
            ))),
        }
    }

    /// Whether the kernel OOM-killed anything in this cgroup
    pub fn was_oom_killed(&self) -> Result<bool> {
        let events = parse_memory_events(&self.read("memory.events")?);
        Ok(events.oom_kill > 0)
    }

    /// Kill every process in the cgroup
    pub fn kill(&self) -> Result<()> {
        self.write("cgroup.kill", "1")
    }

    /// Kill what is left and remove the leaf
    ///
    /// Blocks while killed tasks are reaped; async callers use
    /// [`CgroupHandle::release`].
    pub fn destroy(mut self) -> Result<()> {
        self.remove()
    }

    /// Read OOM evidence and peak usage, then destroy the leaf off the
    /// async worker threads
    pub async fn release(self) -> Result<CgroupUsage> {
        tokio::task::spawn_blocking(move || {
            let usage = CgroupUsage {
                oom_killed: self.was_oom_killed()?,
                memory_peak: self.memory_peak()?,
            };
            self.destroy()?;
            Ok(usage)
        })
        .await
        .map_err(|e| CoderunError::Cgroup(format!("release task failed: {e}")))?
    }

    fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }

        // cgroup.kill is missing before 5.14; killpg already ran then
        let _ = self.kill();

        // rmdir fails with EBUSY until the killed tasks are reaped
        let mut attempts = 0;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) if attempts < 20 => {
                    tracing::trace!(cgroup = %self.name, error = %e, "cgroup busy");
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(CoderunError::Cgroup(format!(
                        "failed to remove {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }

        self.removed = true;
        tracing::debug!(cgroup = %self.name, "cgroup destroyed");
        Ok(())
    }
}

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::error!(cgroup = %self.name, error = %e, "failed to destroy cgroup");
        }
    }
}

/// Counters from a cgroup's memory.events file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryEvents {
    pub max: u64,
    pub oom: u64,
    pub oom_kill: u64,
}

#[must_use]
pub fn parse_memory_events(raw: &str) -> MemoryEvents {
    let mut events = MemoryEvents::default();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse() else { continue };
        match key {
            "max" => events.max = value,
            "oom" => events.oom = value,
            "oom_kill" => events.oom_kill = value,
            _ => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_events() {
        let raw = "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\noom_group_kill 0\n";
        let events = parse_memory_events(raw);
        assert_eq!(
            events,
            MemoryEvents {
                max: 12,
                oom: 1,
                oom_kill: 1
            }
        );
    }

    #[test]
    fn ignores_garbage_lines() {
        let events = parse_memory_events("oom_kill\nmax nope\n\n");
        assert_eq!(events, MemoryEvents::default());
    }

    #[test]
    fn cpu_quota_is_a_share_of_the_period() {
        let config = CgroupsConfig::new("/sys/fs/cgroup/coderun", 1 << 28, 64);
        assert_eq!(config.cpu_max(), "max 100000");
        assert_eq!(config.clone().cpu_percent(50).cpu_max(), "50000 100000");
        assert_eq!(config.cpu_percent(200).cpu_max(), "200000 100000");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn release_waits_without_blocking_the_runtime() {
        // The leaf only becomes removable once another task on this
        // single-threaded runtime has cleared it
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("leaf");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
        fs::write(path.join("memory.peak"), "4096\n").unwrap();
        let handle = CgroupHandle {
            name: "leaf".into(),
            path: path.clone(),
            removed: false,
        };

        let clear = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fs::remove_file(path.join("memory.events")).unwrap();
                fs::remove_file(path.join("memory.peak")).unwrap();
            })
        };

        let usage = handle.release().await.unwrap();
        clear.await.unwrap();
        assert_eq!(
            usage,
            CgroupUsage {
                oom_killed: true,
                memory_peak: Some(4096)
            }
        );
        assert!(!path.exists());
    }

    #[test]
    fn handle_removes_plain_directory() {
        // A plain directory stands in for a cgroup leaf
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("leaf");
        fs::create_dir(&path).unwrap();
        let handle = CgroupHandle {
            name: "leaf".into(),
            path: path.clone(),
            removed: false,
        };
        assert_eq!(handle.memory_peak().unwrap(), None);
        handle.destroy().unwrap();
        assert!(!path.exists());
    }
}
