//! Spawning one confined process group and collecting its output
//!
//! Every toolchain and program invocation goes through [`run_confined`]:
//! the child leads its own process group, stdin is fed and closed, both
//! output streams are captured up to a byte limit, and the whole group is
//! killed with `SIGKILL` when the deadline passes and again once the leader
//! has exited, so background children cannot outlive the run. The leader is
//! reaped with `wait4` so its CPU time is known.

use parking_lot::Mutex;
use std::io::{self, ErrorKind};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::isolation::{CgroupHandle, ChildConfinement};
use crate::{CoderunError, Result};

/// Program, arguments and environment of one invocation
///
/// The environment is exactly `env`; nothing is inherited from the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: PathBuf,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>, current_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: current_dir.into(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable, replacing an earlier value for the same key
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter().fold(self, |spec, (k, v)| spec.env(k, v))
    }
}

/// Deadline and capture settings of one invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Bytes kept per output stream
    pub output_limit: usize,
    /// Time output readers get after the group is killed
    pub kill_grace: Duration,
    /// Bytes written to stdin before it is closed
    pub stdin: Vec<u8>,
}

/// What happened to one invocation
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
    /// The wall-clock deadline passed and the group was killed
    pub timed_out: bool,
    /// User plus system time of the leader and its reaped children
    pub cpu_time: Duration,
    /// The leader used up its `RLIMIT_CPU` soft limit
    pub cpu_limit_exceeded: bool,
}

impl ProcessOutcome {
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }

    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Kill the process group led by `pgid` with `SIGKILL`
///
/// No-op when the group is already gone.
pub fn kill_process_group(pgid: u32) {
    if let Ok(raw) = i32::try_from(pgid) {
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(raw),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

/// Exit status and CPU usage of a reaped leader
#[derive(Debug, Clone, Copy)]
struct Reaped {
    status: ExitStatus,
    cpu_time: Duration,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(u64::try_from(tv.tv_sec).unwrap_or(0))
        + Duration::from_micros(u64::try_from(tv.tv_usec).unwrap_or(0))
}

/// Block until `pid` exits and reap it with its resource usage
fn reap(pid: libc::pid_t) -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: both pointers are valid for the duration of the call
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(Reaped {
        status: ExitStatus::from_raw(status),
        cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
    })
}

/// Kills the group when the owning future is dropped mid-run
struct ProcessGroup {
    pgid: u32,
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        kill_process_group(self.pgid);
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Read `stream` to EOF, keeping at most `limit` bytes
///
/// Reading continues past the limit so a chatty program never blocks on a
/// full pipe.
fn spawn_capture<R>(mut stream: R, limit: usize) -> (Arc<Mutex<Captured>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured = Arc::new(Mutex::new(Captured::default()));
    let sink = Arc::clone(&captured);
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().push(&buf[..n], limit),
            }
        }
    });
    (captured, handle)
}

async fn finish_capture(
    captured: &Arc<Mutex<Captured>>,
    mut handle: JoinHandle<()>,
    grace: Duration,
) -> (Vec<u8>, bool) {
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        // A descendant escaped the group and still holds the pipe
        tracing::debug!("output reader still open after grace period");
        handle.abort();
    }
    let mut captured = captured.lock();
    (std::mem::take(&mut captured.bytes), captured.truncated)
}

/// Spawn `spec` under `confinement` and wait for it within `options.timeout`
///
/// Errors are infrastructure failures only; whatever the program itself
/// does is reported through the [`ProcessOutcome`]. A missing program is
/// reported as [`CoderunError::Toolchain`].
pub async fn run_confined(
    spec: &CommandSpec,
    confinement: ChildConfinement,
    options: RunOptions,
    cgroup: Option<&CgroupHandle>,
) -> Result<ProcessOutcome> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .current_dir(&spec.current_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let cpu_limit = confinement.rlimits.cpu_seconds.map(Duration::from_secs);
    confinement.apply(&mut cmd)?;

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            CoderunError::Toolchain(format!("{} not found: {e}", spec.program))
        }
        _ => CoderunError::Spawn(format!("failed to spawn {}: {e}", spec.program)),
    })?;

    let pid = child
        .id()
        .ok_or_else(|| CoderunError::Spawn(format!("{} exited before tracking", spec.program)))?;
    let leader = libc::pid_t::try_from(pid)
        .map_err(|_| CoderunError::Spawn(format!("pid {pid} out of range")))?;
    let group = ProcessGroup { pgid: pid };

    tracing::debug!(program = %spec.program, pid, "process spawned");

    if let Some(cgroup) = cgroup {
        cgroup.add_process(pid)?;
    }

    let stdin_task = child.stdin.take().map(|mut stdin| {
        let input = options.stdin;
        tokio::spawn(async move {
            // Programs that never read stdin close it early
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != ErrorKind::BrokenPipe {
                    tracing::debug!(error = %e, "failed to write stdin");
                }
            }
        })
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoderunError::Spawn("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CoderunError::Spawn("stderr not captured".into()))?;
    let (out, out_task) = spawn_capture(stdout, options.output_limit);
    let (err, err_task) = spawn_capture(stderr, options.output_limit);

    // Reaped here rather than by tokio; the handle is only kept for its pipes
    let mut reaper = tokio::task::spawn_blocking(move || reap(leader));
    let (reaped, timed_out) = match tokio::time::timeout(options.timeout, &mut reaper).await {
        Ok(joined) => (joined, false),
        Err(_) => {
            tracing::debug!(pid, timeout = ?options.timeout, "deadline passed, killing process group");
            kill_process_group(group.pgid);
            (reaper.await, true)
        }
    };
    let Reaped { status, cpu_time } =
        reaped.map_err(|e| CoderunError::Spawn(format!("wait task for {pid} failed: {e}")))??;
    let elapsed = start.elapsed();
    drop(child);
    let cpu_limit_exceeded = cpu_limit.is_some_and(|limit| cpu_time >= limit);

    // Descendants left running would otherwise hold the pipes open
    drop(group);
    if let Some(task) = stdin_task {
        task.abort();
    }

    let (stdout, stdout_truncated) = finish_capture(&out, out_task, options.kill_grace).await;
    let (stderr, stderr_truncated) = finish_capture(&err, err_task, options.kill_grace).await;

    tracing::debug!(
        pid,
        status = %status,
        timed_out,
        cpu_limit_exceeded,
        elapsed_ms = elapsed.as_millis(),
        cpu_ms = cpu_time.as_millis(),
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "process finished"
    );

    Ok(ProcessOutcome {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed,
        timed_out,
        cpu_time,
        cpu_limit_exceeded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{RlimitSet, SpawnIdentity};

    fn unconfined() -> ChildConfinement {
        ChildConfinement {
            identity: SpawnIdentity::Inherit,
            rlimits: RlimitSet::default(),
            seccomp: None,
            landlock: None,
        }
    }

    fn options(timeout_ms: u64, stdin: &str) -> RunOptions {
        RunOptions {
            timeout: Duration::from_millis(timeout_ms),
            output_limit: 1024,
            kill_grace: Duration::from_millis(200),
            stdin: stdin.as_bytes().to_vec(),
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh", "/").arg("-c").arg(script)
    }

    #[test]
    fn env_replaces_existing_key() {
        let spec = CommandSpec::new("x", "/")
            .env("A", "1")
            .envs([("B", "2"), ("A", "3")]);
        assert_eq!(
            spec.env,
            vec![("B".to_string(), "2".to_string()), ("A".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn capture_truncates_at_limit() {
        let mut c = Captured::default();
        c.push(b"hello", 8);
        c.push(b"world", 8);
        assert_eq!(c.bytes, b"hellowor");
        assert!(c.truncated);
    }

    // Inherited identity and no filters: these exercise the plumbing only
    #[tokio::test]
    async fn feeds_stdin_and_captures_output() {
        let outcome = run_confined(&sh("cat; echo oops >&2"), unconfined(), options(5000, "hi"), None)
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, b"hi");
        assert_eq!(outcome.stderr_lossy(), "oops\n");
    }

    #[tokio::test]
    async fn environment_is_cleared() {
        let spec = CommandSpec::new("/usr/bin/env", "/").env("ONLY", "this");
        let outcome = run_confined(&spec, unconfined(), options(5000, ""), None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout_lossy(), "ONLY=this\n");
    }

    #[tokio::test]
    async fn deadline_kills_whole_group() {
        let start = Instant::now();
        let outcome = run_confined(&sh("sleep 30 & sleep 30"), unconfined(), options(300, ""), None)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.signal(), Some(libc::SIGKILL));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn background_child_does_not_hold_the_run() {
        let start = Instant::now();
        let outcome = run_confined(&sh("sleep 30 & echo done"), unconfined(), options(5000, ""), None)
            .await
            .unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code(), Some(0));
        assert_eq!(outcome.stdout_lossy(), "done\n");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_beyond_limit_is_drained_and_flagged() {
        let outcome = run_confined(
            &sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done"),
            unconfined(),
            options(5000, ""),
            None,
        )
        .await
        .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.len(), 1024);
        assert!(outcome.stdout_truncated);
    }

    #[tokio::test]
    async fn reports_cpu_time() {
        let outcome = run_confined(
            &sh("i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done"),
            unconfined(),
            options(10_000, ""),
            None,
        )
        .await
        .unwrap();
        assert!(outcome.success());
        assert!(outcome.cpu_time > Duration::ZERO);
        assert!(!outcome.cpu_limit_exceeded);
    }

    #[tokio::test]
    async fn cpu_limit_kill_is_a_timeout() {
        // SIGXCPU ignored, so only the hard limit's SIGKILL stops the loop
        let confinement = ChildConfinement {
            rlimits: RlimitSet {
                cpu_seconds: Some(1),
                ..RlimitSet::default()
            },
            ..unconfined()
        };
        let outcome = run_confined(
            &sh("trap '' XCPU; while :; do :; done"),
            confinement,
            options(10_000, ""),
            None,
        )
        .await
        .unwrap();

        assert!(!outcome.timed_out);
        assert_eq!(outcome.signal(), Some(libc::SIGKILL));
        assert!(outcome.cpu_limit_exceeded, "cpu time {:?}", outcome.cpu_time);
        assert_eq!(
            crate::runner::classify(&outcome, false, false),
            crate::TerminationReason::Timeout
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_toolchain_error() {
        let spec = CommandSpec::new("/nonexistent/compiler", "/");
        let err = run_confined(&spec, unconfined(), options(1000, ""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoderunError::Toolchain(_)));
    }
}
