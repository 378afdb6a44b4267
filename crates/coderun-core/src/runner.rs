//! Submission runner
//!
//! One [`Runner`] is built per process from a [`ConfinementPolicy`]. Each
//! call to [`Runner::run`] or [`Runner::grade`] owns a fresh workspace for
//! its whole lifetime, so any number of calls may proceed concurrently.

use seccompiler::BpfProgram;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::Instrument;

use crate::config::RunLimits;
use crate::isolation::{
    CgroupHandle, CgroupUsage, CgroupsConfig, ChildConfinement, LandlockConfig, RlimitSet,
    SpawnIdentity, cgroups, seccomp,
};
use crate::process::{ProcessOutcome, RunOptions, run_confined};
use crate::result::{ExecutionResult, GradeReport, TerminationReason, TestOutcome};
use crate::submission::{Language, Submission};
use crate::toolchain::{self, Toolchain, ToolchainContext};
use crate::workspace::Workspace;
use crate::{CoderunError, ConfinementPolicy, Result};

/// Tasks allowed in a compile leaf; `go build` runs many threaded tools
const COMPILE_PIDS_MAX: u32 = 512;

/// Executes submissions under one confinement policy
#[derive(Clone)]
pub struct Runner {
    policy: ConfinementPolicy,
    identity: SpawnIdentity,
    seccomp: Option<Arc<BpfProgram>>,
    toolchains: HashMap<Language, Arc<dyn Toolchain>>,
    /// Threads a run step may keep busy at once
    parallelism: u64,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("policy", &self.policy)
            .field("identity", &self.identity)
            .field("seccomp", &self.seccomp.is_some())
            .field("toolchains", &self.toolchains.keys().collect::<Vec<_>>())
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

impl Runner {
    /// Verify the process can enforce `policy` and prepare shared state
    ///
    /// Fails instead of ever running a submission as root.
    pub fn new(policy: ConfinementPolicy) -> Result<Self> {
        let identity = policy.verify_process()?;

        if let SpawnIdentity::Drop(_) = identity {
            // Dropped children must be able to traverse into their workspace
            let root = &policy.workspace_root;
            let mode = fs::metadata(root)?.permissions().mode();
            if mode & 0o001 == 0 {
                fs::set_permissions(root, fs::Permissions::from_mode((mode & 0o7777) | 0o711))?;
                tracing::info!(root = ?root, "opened workspace root for traversal");
            }
        }

        let seccomp = if policy.seccomp {
            Some(Arc::new(seccomp::build_denylist()?))
        } else {
            tracing::warn!("seccomp disabled by policy");
            None
        };
        if !policy.landlock {
            tracing::warn!("landlock disabled by policy");
        }

        if let Some(root) = &policy.cgroup_root {
            cgroups::enable_controllers(root);
        }

        let toolchains = [Language::Go, Language::Python, Language::JavaScript]
            .into_iter()
            .map(|language| (language, toolchain::for_language(language)))
            .collect();

        let parallelism = thread::available_parallelism()
            .map_or(1, NonZeroUsize::get)
            .try_into()
            .unwrap_or(u64::MAX);

        tracing::info!(
            workspace_root = ?policy.workspace_root,
            identity = ?identity,
            cgroups = policy.cgroup_root.is_some(),
            parallelism,
            "runner ready"
        );

        Ok(Self {
            policy,
            identity,
            seccomp,
            toolchains,
            parallelism,
        })
    }

    /// Replace the toolchain used for `language`
    #[must_use]
    pub fn with_toolchain(mut self, language: Language, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchains.insert(language, toolchain);
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &ConfinementPolicy {
        &self.policy
    }

    /// Compile and run `submission` once, with its own stdin
    ///
    /// Never fails: infrastructure errors become an `internal_error` result.
    pub async fn run(&self, submission: &Submission) -> ExecutionResult {
        let started = Instant::now();
        let span = tracing::info_span!(
            "submission",
            language = %submission.language,
            submission_id = tracing::field::Empty
        );

        async {
            match self.try_run(submission).await {
                Ok(result) => {
                    tracing::info!(
                        reason = %result.reason,
                        duration_ms = result.duration.as_millis(),
                        "submission finished"
                    );
                    result
                }
                Err(e) => {
                    tracing::error!(error = %e, "submission failed internally");
                    ExecutionResult::internal(e.to_string(), started.elapsed())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Compile once and run every test case of `submission`
    ///
    /// A case passes when the program completes and its stdout equals the
    /// expected output with surrounding whitespace trimmed.
    pub async fn grade(&self, submission: &Submission) -> GradeReport {
        let started = Instant::now();
        let total = submission.tests.len();
        let span = tracing::info_span!(
            "grade",
            language = %submission.language,
            tests = total,
            submission_id = tracing::field::Empty
        );

        async {
            match self.try_grade(submission).await {
                Ok(report) => {
                    tracing::info!(
                        passed = report.summary.passed_count,
                        total,
                        "grading finished"
                    );
                    report
                }
                Err(e) => {
                    tracing::error!(error = %e, "grading failed internally");
                    GradeReport::aborted(ExecutionResult::internal(e.to_string(), started.elapsed()), total)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_run(&self, submission: &Submission) -> Result<ExecutionResult> {
        let toolchain = self.toolchain(submission.language)?;
        let limits = self.policy.effective_limits(&submission.limits);
        let mut workspace = self.prepare(toolchain.as_ref(), &submission.source)?;

        let result = match self.compile(&workspace, toolchain.as_ref(), limits).await {
            Ok(Some(failed)) => Ok(failed),
            Ok(None) => {
                let stdin = submission.stdin.as_deref().unwrap_or_default();
                self.execute(&workspace, toolchain.as_ref(), stdin, limits).await
            }
            Err(e) => Err(e),
        };

        finish(&mut workspace);
        result
    }

    async fn try_grade(&self, submission: &Submission) -> Result<GradeReport> {
        let toolchain = self.toolchain(submission.language)?;
        let limits = self.policy.effective_limits(&submission.limits);
        let mut workspace = self.prepare(toolchain.as_ref(), &submission.source)?;

        if let Some(failed) = self.compile(&workspace, toolchain.as_ref(), limits).await? {
            finish(&mut workspace);
            return Ok(GradeReport::aborted(failed, submission.tests.len()));
        }

        let mut details = Vec::with_capacity(submission.tests.len());
        for test in &submission.tests {
            let stdin = test.stdin.as_deref().unwrap_or_default();
            let result = self.execute(&workspace, toolchain.as_ref(), stdin, limits).await?;
            let outcome = TestOutcome::judge(test, result);
            tracing::debug!(test = %test.id, passed = outcome.passed, reason = %outcome.reason, "test case finished");
            details.push(outcome);
        }

        finish(&mut workspace);
        Ok(GradeReport::from_outcomes(details))
    }

    fn toolchain(&self, language: Language) -> Result<Arc<dyn Toolchain>> {
        self.toolchains
            .get(&language)
            .cloned()
            .ok_or_else(|| CoderunError::Toolchain(format!("no toolchain for {language}")))
    }

    fn prepare(&self, toolchain: &dyn Toolchain, source: &str) -> Result<Workspace> {
        let workspace = Workspace::create(&self.policy.workspace_root, self.identity.owner())?;
        tracing::Span::current().record("submission_id", tracing::field::display(workspace.id()));
        workspace.write_source(toolchain.source_file(), source)?;
        Ok(workspace)
    }

    fn context<'a>(
        &'a self,
        workspace: &'a Workspace,
        source: &'a Path,
        tmp: &'a Path,
        memory: u64,
    ) -> ToolchainContext<'a> {
        ToolchainContext {
            workspace: workspace.path(),
            source,
            tmp,
            search_path: &self.policy.search_path,
            memory_limit: memory,
        }
    }

    fn confinement(
        &self,
        workspace: &Workspace,
        toolchain: &dyn Toolchain,
        rlimits: RlimitSet,
    ) -> ChildConfinement {
        let landlock = self.policy.landlock.then(|| {
            let ro = self.policy.ro_paths.iter().cloned().chain(toolchain.ro_paths());
            ro.fold(LandlockConfig::default(), LandlockConfig::ro)
                .rw(workspace.path())
                .rw("/dev/null")
        });

        ChildConfinement {
            identity: self.identity,
            rlimits,
            seccomp: self.seccomp.clone(),
            landlock,
        }
    }

    fn cgroup(
        &self,
        workspace: &Workspace,
        phase: &str,
        memory: u64,
        pids: u32,
    ) -> Result<Option<CgroupHandle>> {
        let Some(root) = &self.policy.cgroup_root else {
            return Ok(None);
        };
        let config = CgroupsConfig::new(root, memory, pids).cpu_percent(self.policy.cpu_percent);
        config
            .create_cgroup(&format!("{}-{phase}", workspace.id()))
            .map(Some)
    }

    /// Run the toolchain's compile step; `Some` is a `compile_error` result
    async fn compile(
        &self,
        workspace: &Workspace,
        toolchain: &dyn Toolchain,
        limits: RunLimits,
    ) -> Result<Option<ExecutionResult>> {
        let source = workspace.path().join(toolchain.source_file());
        let tmp = workspace.tmp_dir();
        let ctx = self.context(workspace, &source, &tmp, limits.memory);
        let Some(spec) = toolchain.compile(&ctx) else {
            return Ok(None);
        };

        let mut rlimits = RlimitSet::default().file_size(self.policy.file_size_limit);
        if let Some(bytes) = self.policy.compile_memory_limit {
            rlimits = rlimits.address_space(bytes);
        }
        let cgroup_memory = self
            .policy
            .compile_memory_limit
            .unwrap_or(self.policy.max_memory_limit);
        let cgroup = self.cgroup(workspace, "compile", cgroup_memory, COMPILE_PIDS_MAX)?;

        let outcome = run_confined(
            &spec,
            self.confinement(workspace, toolchain, rlimits),
            RunOptions {
                timeout: self.policy.compile_timeout,
                output_limit: self.policy.output_limit,
                kill_grace: self.policy.kill_grace,
                stdin: Vec::new(),
            },
            cgroup.as_ref(),
        )
        .await?;
        let memory_peak_bytes = release(cgroup).await?.memory_peak;

        if outcome.success() {
            tracing::debug!(elapsed_ms = outcome.elapsed.as_millis(), "compile step succeeded");
            return Ok(None);
        }

        let mut stderr = outcome.stderr_lossy();
        if outcome.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "compilation timed out after {}ms\n",
                self.policy.compile_timeout.as_millis()
            ));
        }

        Ok(Some(ExecutionResult {
            stderr,
            ..to_result(&outcome, TerminationReason::CompileError, memory_peak_bytes)
        }))
    }

    /// Run the built program once with `stdin`
    async fn execute(
        &self,
        workspace: &Workspace,
        toolchain: &dyn Toolchain,
        stdin: &str,
        limits: RunLimits,
    ) -> Result<ExecutionResult> {
        let source = workspace.path().join(toolchain.source_file());
        let tmp = workspace.tmp_dir();
        let ctx = self.context(workspace, &source, &tmp, limits.memory);
        let spec = toolchain.run(&ctx);

        let mut rlimits = RlimitSet::default()
            .cpu_for(limits.time, self.parallelism)
            .file_size(self.policy.file_size_limit);
        if let Some(bytes) = toolchain.memory_enforcement().address_space(limits.memory) {
            rlimits = rlimits.address_space(bytes);
        }
        let cgroup = self.cgroup(workspace, "run", limits.memory, self.policy.max_pids)?;

        let outcome = run_confined(
            &spec,
            self.confinement(workspace, toolchain, rlimits),
            RunOptions {
                timeout: limits.time,
                output_limit: self.policy.output_limit,
                kill_grace: self.policy.kill_grace,
                stdin: stdin.as_bytes().to_vec(),
            },
            cgroup.as_ref(),
        )
        .await?;
        let usage = release(cgroup).await?;

        let diagnosed = toolchain.is_out_of_memory(&String::from_utf8_lossy(&outcome.stderr));
        let reason = classify(&outcome, usage.oom_killed, diagnosed);
        Ok(to_result(&outcome, reason, usage.memory_peak))
    }
}

/// Remove the workspace, logging instead of failing the submission
fn finish(workspace: &mut Workspace) {
    if let Err(e) = workspace.cleanup() {
        tracing::error!(workspace = %workspace.id(), error = %e, "failed to remove workspace");
    }
}

async fn release(cgroup: Option<CgroupHandle>) -> Result<CgroupUsage> {
    match cgroup {
        Some(cgroup) => cgroup.release().await,
        None => Ok(CgroupUsage::default()),
    }
}

fn to_result(
    outcome: &ProcessOutcome,
    reason: TerminationReason,
    memory_peak_bytes: Option<u64>,
) -> ExecutionResult {
    ExecutionResult {
        reason,
        stdout: outcome.stdout_lossy(),
        stderr: outcome.stderr_lossy(),
        exit_code: outcome.exit_code(),
        signal: outcome.signal(),
        duration: outcome.elapsed,
        stdout_truncated: outcome.stdout_truncated,
        stderr_truncated: outcome.stderr_truncated,
        memory_peak_bytes,
        error: None,
    }
}

/// Map a finished run step to its termination reason
///
/// First match wins: deadline, `SIGXCPU` or an exhausted CPU limit, then OOM
/// evidence from the cgroup or the runtime's own diagnostic on a failed
/// exit, then the exit status.
#[must_use]
pub fn classify(outcome: &ProcessOutcome, oom_killed: bool, oom_diagnostic: bool) -> TerminationReason {
    if outcome.timed_out
        || outcome.cpu_limit_exceeded
        || outcome.signal() == Some(libc::SIGXCPU)
    {
        TerminationReason::Timeout
    } else if oom_killed || (!outcome.status.success() && oom_diagnostic) {
        TerminationReason::MemoryExceeded
    } else if outcome.status.success() {
        TerminationReason::Completed
    } else {
        TerminationReason::RuntimeError
    }
}
