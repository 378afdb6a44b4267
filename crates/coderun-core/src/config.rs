//! Confinement policy
//!
//! The policy is the capability object every [`crate::Runner`] is built
//! from: where workspaces live, which identity programs run as, which host
//! paths they may read, and the resource ceilings requests are clamped to.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::submission::Limits;
use crate::{CoderunError, Result};

/// `PATH` of the Go runner image
pub const DEFAULT_SEARCH_PATH: &str =
    "/usr/local/go/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Numeric identity programs are dropped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The `sandbox` account provisioned in the runner image
    #[must_use]
    pub const fn sandbox() -> Self {
        Self::new(1001, 1001)
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0 || self.gid == 0
    }

    /// Parse `uid:gid`, a bare uid, or an account name
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some((uid, gid)) = spec.split_once(':') {
            let uid = uid
                .parse()
                .map_err(|_| CoderunError::Config(format!("invalid uid in {spec:?}")))?;
            let gid = gid
                .parse()
                .map_err(|_| CoderunError::Config(format!("invalid gid in {spec:?}")))?;
            return Ok(Self::new(uid, gid));
        }

        if let Ok(uid) = spec.parse::<u32>() {
            return Ok(Self::new(uid, uid));
        }

        let user = nix::unistd::User::from_name(spec)?
            .ok_or_else(|| CoderunError::Config(format!("no such user: {spec}")))?;
        Ok(Self::new(user.uid.as_raw(), user.gid.as_raw()))
    }
}

/// Limits actually enforced on one run step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub time: Duration,
    pub memory: u64,
}

/// Privilege and resource restrictions applied to a runner instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfinementPolicy {
    /// Directory under which one workspace per submission is created
    pub workspace_root: PathBuf,

    /// Identity to drop to when the runner holds root
    pub identity: Option<Identity>,

    /// Host paths programs may read and execute
    pub ro_paths: Vec<PathBuf>,

    /// `PATH` handed to toolchains and programs
    pub search_path: String,

    /// Wall-clock limit used when a submission names none
    pub default_time_limit: Duration,

    /// Upper bound for requested wall-clock limits
    pub max_time_limit: Duration,

    /// Memory limit used when a submission names none
    pub default_memory_limit: u64,

    /// Upper bound for requested memory limits
    pub max_memory_limit: u64,

    /// Wall-clock budget of the compile step
    pub compile_timeout: Duration,

    /// Address-space ceiling of the compile step, if any
    pub compile_memory_limit: Option<u64>,

    /// Bytes captured per output stream
    pub output_limit: usize,

    /// Largest file a program may write (`RLIMIT_FSIZE`)
    pub file_size_limit: u64,

    /// Maximum number of tasks, enforced through the cgroup
    pub max_pids: u32,

    /// How long output readers may linger after the process group is killed
    pub kill_grace: Duration,

    /// Install the syscall denylist in every spawned process
    pub seccomp: bool,

    /// Install Landlock filesystem rules in every spawned process
    pub landlock: bool,

    /// Delegated cgroup v2 directory for per-submission leaves
    pub cgroup_root: Option<PathBuf>,

    /// CPU bandwidth of a leaf as percentage of one core; 0 is unlimited
    pub cpu_percent: u32,
}

impl Default for ConfinementPolicy {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/sandbox"),
            identity: Some(Identity::sandbox()),
            ro_paths: vec![
                PathBuf::from("/usr"),
                PathBuf::from("/lib"),
                PathBuf::from("/lib64"),
                PathBuf::from("/bin"),
                PathBuf::from("/etc"),
                PathBuf::from("/usr/local/go"),
                PathBuf::from("/dev/urandom"),
            ],
            search_path: DEFAULT_SEARCH_PATH.into(),
            default_time_limit: Duration::from_secs(30),
            max_time_limit: Duration::from_secs(60),
            default_memory_limit: 256 * 1024 * 1024, // 256MB
            max_memory_limit: 1024 * 1024 * 1024,
            compile_timeout: Duration::from_secs(30),
            compile_memory_limit: None,
            output_limit: 64 * 1024,
            file_size_limit: 64 * 1024 * 1024,
            max_pids: 64,
            kill_grace: Duration::from_millis(500),
            seccomp: true,
            landlock: true,
            cgroup_root: None,
            cpu_percent: 50,
        }
    }
}

impl ConfinementPolicy {
    /// Create a new policy builder
    #[must_use]
    pub fn builder() -> ConfinementPolicyBuilder {
        ConfinementPolicyBuilder::default()
    }

    /// Build a policy from `CODERUN_*` environment variables
    ///
    /// The backend's `RUNNER_TIMEOUT_MS` and `RUNNER_MEMORY_LIMIT` are
    /// honoured as fallbacks.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a policy from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut policy = Self::default();
        let get = |primary: &str, fallback: &str| lookup(primary).or_else(|| lookup(fallback));

        if let Some(root) = lookup("CODERUN_WORKSPACE_ROOT") {
            policy.workspace_root = PathBuf::from(root);
        }

        if let Some(user) = lookup("CODERUN_USER") {
            policy.identity = match user.as_str() {
                "" | "none" => None,
                spec => Some(Identity::parse(spec)?),
            };
        }

        if let Some(paths) = lookup("CODERUN_RO_PATHS") {
            policy.ro_paths = std::env::split_paths(&paths).collect();
        }

        if let Some(path) = lookup("CODERUN_PATH") {
            policy.search_path = path;
        }

        if let Some(ms) = get("CODERUN_TIME_LIMIT_MS", "RUNNER_TIMEOUT_MS") {
            policy.default_time_limit = Duration::from_millis(parse_number(&ms)?);
        }

        if let Some(ms) = lookup("CODERUN_MAX_TIME_LIMIT_MS") {
            policy.max_time_limit = Duration::from_millis(parse_number(&ms)?);
        }

        if let Some(size) = get("CODERUN_MEMORY_LIMIT", "RUNNER_MEMORY_LIMIT") {
            policy.default_memory_limit = parse_size(&size)?;
        }

        if let Some(size) = lookup("CODERUN_MAX_MEMORY_LIMIT") {
            policy.max_memory_limit = parse_size(&size)?;
        }

        if let Some(ms) = lookup("CODERUN_COMPILE_TIMEOUT_MS") {
            policy.compile_timeout = Duration::from_millis(parse_number(&ms)?);
        }

        if let Some(size) = lookup("CODERUN_OUTPUT_LIMIT") {
            policy.output_limit = usize::try_from(parse_size(&size)?)
                .map_err(|_| CoderunError::Config(format!("output limit too large: {size}")))?;
        }

        if let Some(root) = lookup("CODERUN_CGROUP_ROOT") {
            policy.cgroup_root = (!root.is_empty()).then(|| PathBuf::from(root));
        }

        if let Some(percent) = lookup("CODERUN_CPU_PERCENT") {
            policy.cpu_percent = u32::try_from(parse_number(&percent)?)
                .map_err(|_| CoderunError::Config(format!("cpu percent too large: {percent}")))?;
        }

        if let Some(flag) = lookup("CODERUN_SECCOMP") {
            policy.seccomp = parse_flag(&flag)?;
        }

        if let Some(flag) = lookup("CODERUN_LANDLOCK") {
            policy.landlock = parse_flag(&flag)?;
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Reject policies that cannot be enforced
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_some_and(|id| id.is_root()) {
            return Err(CoderunError::Config(
                "confinement identity must not be root".into(),
            ));
        }
        if self.default_time_limit.is_zero() || self.max_time_limit < self.default_time_limit {
            return Err(CoderunError::Config(format!(
                "time limits inconsistent: default {:?}, max {:?}",
                self.default_time_limit, self.max_time_limit
            )));
        }
        if self.default_memory_limit == 0 || self.max_memory_limit < self.default_memory_limit {
            return Err(CoderunError::Config(format!(
                "memory limits inconsistent: default {}, max {}",
                self.default_memory_limit, self.max_memory_limit
            )));
        }
        if self.output_limit == 0 {
            return Err(CoderunError::Config("output limit must be positive".into()));
        }
        Ok(())
    }

    /// Check that this process can enforce the policy before accepting work
    ///
    /// Fails when the runner holds root without a confinement identity to
    /// drop to, holds effective capabilities as a non-root user, or cannot
    /// use the workspace root.
    pub fn verify_process(&self) -> Result<crate::isolation::SpawnIdentity> {
        self.validate()?;
        let spawn = crate::isolation::identity::resolve(self.identity)?;

        let meta = std::fs::metadata(&self.workspace_root).map_err(|e| {
            CoderunError::Config(format!(
                "workspace root {} unusable: {e}",
                self.workspace_root.display()
            ))
        })?;
        if !meta.is_dir() {
            return Err(CoderunError::Config(format!(
                "workspace root {} is not a directory",
                self.workspace_root.display()
            )));
        }
        Ok(spawn)
    }

    /// Resolve requested limits against defaults and ceilings
    #[must_use]
    pub fn effective_limits(&self, requested: &Limits) -> RunLimits {
        let time = requested
            .time_limit()
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_time_limit)
            .min(self.max_time_limit);
        let memory = requested
            .memory_limit_bytes
            .filter(|m| *m > 0)
            .unwrap_or(self.default_memory_limit)
            .min(self.max_memory_limit);
        RunLimits { time, memory }
    }
}

/// Builder for `ConfinementPolicy`
#[derive(Debug, Default)]
pub struct ConfinementPolicyBuilder {
    policy: ConfinementPolicy,
}

impl ConfinementPolicyBuilder {
    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy.workspace_root = path.into();
        self
    }

    #[must_use]
    pub const fn identity(mut self, identity: Option<Identity>) -> Self {
        self.policy.identity = identity;
        self
    }

    #[must_use]
    pub fn ro_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy.ro_paths.push(path.into());
        self
    }

    #[must_use]
    pub fn ro_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.policy.ro_paths = paths;
        self
    }

    #[must_use]
    pub fn search_path(mut self, path: impl Into<String>) -> Self {
        self.policy.search_path = path.into();
        self
    }

    #[must_use]
    pub const fn default_time_limit(mut self, limit: Duration) -> Self {
        self.policy.default_time_limit = limit;
        self
    }

    #[must_use]
    pub const fn max_time_limit(mut self, limit: Duration) -> Self {
        self.policy.max_time_limit = limit;
        self
    }

    #[must_use]
    pub const fn default_memory_limit(mut self, bytes: u64) -> Self {
        self.policy.default_memory_limit = bytes;
        self
    }

    #[must_use]
    pub const fn default_memory_limit_mb(self, mb: u64) -> Self {
        self.default_memory_limit(mb * 1024 * 1024)
    }

    #[must_use]
    pub const fn max_memory_limit(mut self, bytes: u64) -> Self {
        self.policy.max_memory_limit = bytes;
        self
    }

    #[must_use]
    pub const fn compile_timeout(mut self, limit: Duration) -> Self {
        self.policy.compile_timeout = limit;
        self
    }

    #[must_use]
    pub const fn compile_memory_limit(mut self, bytes: Option<u64>) -> Self {
        self.policy.compile_memory_limit = bytes;
        self
    }

    #[must_use]
    pub const fn output_limit(mut self, bytes: usize) -> Self {
        self.policy.output_limit = bytes;
        self
    }

    #[must_use]
    pub const fn file_size_limit(mut self, bytes: u64) -> Self {
        self.policy.file_size_limit = bytes;
        self
    }

    #[must_use]
    pub const fn max_pids(mut self, pids: u32) -> Self {
        self.policy.max_pids = pids;
        self
    }

    #[must_use]
    pub const fn kill_grace(mut self, grace: Duration) -> Self {
        self.policy.kill_grace = grace;
        self
    }

    #[must_use]
    pub const fn seccomp(mut self, enabled: bool) -> Self {
        self.policy.seccomp = enabled;
        self
    }

    #[must_use]
    pub const fn landlock(mut self, enabled: bool) -> Self {
        self.policy.landlock = enabled;
        self
    }

    #[must_use]
    pub fn cgroup_root(mut self, root: Option<PathBuf>) -> Self {
        self.policy.cgroup_root = root;
        self
    }

    #[must_use]
    pub const fn cpu_percent(mut self, percent: u32) -> Self {
        self.policy.cpu_percent = percent;
        self
    }

    pub fn build(self) -> Result<ConfinementPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Daemon socket path: `$CODERUN_SOCKET`, or `/run/coderun/coderun.sock`
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var("CODERUN_SOCKET")
        .map_or_else(|_| PathBuf::from("/run/coderun/coderun.sock"), PathBuf::from)
}

/// Parse a size such as `256m`, `64k`, `1g` or a plain byte count
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let (digits, multiplier) = match trimmed.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(|| CoderunError::Config(format!("invalid size: {input:?}")))
}

fn parse_number(input: &str) -> Result<u64> {
    input
        .trim()
        .parse()
        .map_err(|_| CoderunError::Config(format!("invalid number: {input:?}")))
}

fn parse_flag(input: &str) -> Result<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CoderunError::Config(format!("invalid flag: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("256m").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("m").is_err());
    }

    #[test]
    fn identity_specs() {
        assert_eq!(Identity::parse("1001:1002").unwrap(), Identity::new(1001, 1002));
        assert_eq!(Identity::parse("65534").unwrap(), Identity::new(65534, 65534));
        assert!(Identity::parse("1001:x").is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        let policy = ConfinementPolicy::from_lookup(lookup(&[
            ("CODERUN_WORKSPACE_ROOT", "/tmp/ws"),
            ("RUNNER_TIMEOUT_MS", "5000"),
            ("RUNNER_MEMORY_LIMIT", "128m"),
            ("CODERUN_USER", "2000:2000"),
            ("CODERUN_SECCOMP", "off"),
        ]))
        .unwrap();

        assert_eq!(policy.workspace_root, PathBuf::from("/tmp/ws"));
        assert_eq!(policy.default_time_limit, Duration::from_secs(5));
        assert_eq!(policy.default_memory_limit, 128 * 1024 * 1024);
        assert_eq!(policy.identity, Some(Identity::new(2000, 2000)));
        assert!(!policy.seccomp);
        assert!(policy.landlock);
    }

    #[test]
    fn cpu_quota_defaults_to_half_a_core() {
        assert_eq!(ConfinementPolicy::default().cpu_percent, 50);

        let policy =
            ConfinementPolicy::from_lookup(lookup(&[("CODERUN_CPU_PERCENT", "200")])).unwrap();
        assert_eq!(policy.cpu_percent, 200);

        let policy =
            ConfinementPolicy::from_lookup(lookup(&[("CODERUN_CPU_PERCENT", "0")])).unwrap();
        assert_eq!(policy.cpu_percent, 0);

        assert!(ConfinementPolicy::from_lookup(lookup(&[("CODERUN_CPU_PERCENT", "half")])).is_err());
    }

    #[test]
    fn primary_variable_wins_over_backend_fallback() {
        let policy = ConfinementPolicy::from_lookup(lookup(&[
            ("CODERUN_TIME_LIMIT_MS", "2000"),
            ("RUNNER_TIMEOUT_MS", "9000"),
        ]))
        .unwrap();
        assert_eq!(policy.default_time_limit, Duration::from_secs(2));
    }

    #[test]
    fn root_identity_is_rejected() {
        let err = ConfinementPolicy::from_lookup(lookup(&[("CODERUN_USER", "0:0")]));
        assert!(err.is_err());
    }

    #[test]
    fn requested_limits_are_clamped() {
        let policy = ConfinementPolicy::default();

        let limits = policy.effective_limits(&Limits::default());
        assert_eq!(limits.time, policy.default_time_limit);
        assert_eq!(limits.memory, policy.default_memory_limit);

        let limits = policy.effective_limits(&Limits {
            time_limit_ms: Some(600_000),
            memory_limit_bytes: Some(u64::MAX),
        });
        assert_eq!(limits.time, policy.max_time_limit);
        assert_eq!(limits.memory, policy.max_memory_limit);

        let limits = policy.effective_limits(&Limits {
            time_limit_ms: Some(2000),
            memory_limit_bytes: Some(0),
        });
        assert_eq!(limits.time, Duration::from_secs(2));
        assert_eq!(limits.memory, policy.default_memory_limit);
    }
}
