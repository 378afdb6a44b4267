//! Execution result types
//!
//! A plain run reports one [`ExecutionResult`]. A graded run reports a
//! [`GradeReport`] in the backend's grading format: camelCase keys, one
//! flat entry per test case.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::submission::TestCase;

/// Why a submission stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Exited with status 0
    Completed,
    /// Killed for exceeding its wall-clock or CPU limit
    Timeout,
    /// Killed or aborted for exceeding its memory ceiling
    MemoryExceeded,
    /// Any other abnormal exit
    RuntimeError,
    /// Compile step failed; the program never ran
    CompileError,
    /// The runner itself failed; not the submission's fault
    InternalError,
}

impl TerminationReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::RuntimeError => "runtime_error",
            Self::CompileError => "compile_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one confined execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub reason: TerminationReason,

    /// Captured standard output, lossily decoded
    pub stdout: String,

    /// Captured standard error, or compiler diagnostics for `compile_error`
    pub stderr: String,

    /// Exit code, if the process exited on its own
    pub exit_code: Option<i32>,

    /// Terminating signal, if the process was killed
    pub signal: Option<i32>,

    /// Wall-clock duration of the final phase
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,

    pub stdout_truncated: bool,

    pub stderr_truncated: bool,

    /// Peak memory as reported by the cgroup, when one was used
    pub memory_peak_bytes: Option<u64>,

    /// Operator-facing diagnostic for `internal_error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result for a failure of the runner infrastructure
    #[must_use]
    pub fn internal(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            reason: TerminationReason::InternalError,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            duration,
            stdout_truncated: false,
            stderr_truncated: false,
            memory_peak_bytes: None,
            error: Some(message.into()),
        }
    }

    /// Copy that is safe to show to a submitter
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            error: None,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason == TerminationReason::Completed
    }

    /// Whether the execution environment, not the submission, failed
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.reason == TerminationReason::InternalError
    }
}

/// Outcome of one test case of a graded submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub test_id: String,
    pub passed: bool,
    #[serde(rename = "isHidden")]
    pub hidden: bool,

    /// The case's hint, only when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    pub reason: TerminationReason,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(rename = "durationMs", with = "duration_ms")]
    pub duration: Duration,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub memory_peak_bytes: Option<u64>,

    /// Operator-facing diagnostic for `internal_error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestOutcome {
    /// Judge `result` against `case`
    ///
    /// Passes when the program completed and its stdout matches.
    #[must_use]
    pub fn judge(case: &TestCase, result: ExecutionResult) -> Self {
        let passed = result.is_success() && case.matches(&result.stdout);
        Self {
            test_id: case.id.clone(),
            passed,
            hidden: case.hidden,
            hint: if passed { None } else { case.hint.clone() },
            reason: result.reason,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            signal: result.signal,
            duration: result.duration,
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
            memory_peak_bytes: result.memory_peak_bytes,
            error: result.error,
        }
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.reason == TerminationReason::InternalError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummary {
    pub passed_count: usize,
    pub total: usize,
}

/// Result of a graded submission: one compile, one run per test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeReport {
    pub passed: bool,
    pub details: Vec<TestOutcome>,
    pub summary: GradeSummary,

    /// Run time of every case, or of the compile step that stopped them
    #[serde(rename = "executionTimeMs", with = "duration_ms")]
    pub execution_time: Duration,

    /// Present when the submission never reached its test cases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<ExecutionResult>,
}

impl GradeReport {
    /// Report for a submission stopped before any test ran
    #[must_use]
    pub fn aborted(result: ExecutionResult, total: usize) -> Self {
        Self {
            passed: false,
            details: Vec::new(),
            summary: GradeSummary {
                passed_count: 0,
                total,
            },
            execution_time: result.duration,
            compile: Some(result),
        }
    }

    /// Passed only when there was at least one test case and all passed
    #[must_use]
    pub fn from_outcomes(details: Vec<TestOutcome>) -> Self {
        let passed_count = details.iter().filter(|d| d.passed).count();
        let total = details.len();
        Self {
            passed: total > 0 && passed_count == total,
            execution_time: details.iter().map(|d| d.duration).sum(),
            details,
            summary: GradeSummary { passed_count, total },
            compile: None,
        }
    }

    /// Whether any part of the report is an infrastructure failure
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.compile.as_ref().is_some_and(ExecutionResult::is_internal)
            || self.details.iter().any(TestOutcome::is_internal)
    }

    /// Copy that is safe to show to a submitter
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            details: self
                .details
                .iter()
                .map(|d| TestOutcome {
                    error: None,
                    ..d.clone()
                })
                .collect(),
            compile: self.compile.as_ref().map(ExecutionResult::redacted),
            ..self.clone()
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_string(&TerminationReason::MemoryExceeded).unwrap();
        assert_eq!(json, "\"memory_exceeded\"");
        assert_eq!(TerminationReason::CompileError.to_string(), "compile_error");
    }

    #[test]
    fn internal_result_is_redacted_for_submitters() {
        let result = ExecutionResult::internal("workspace root is read-only", Duration::ZERO);
        assert!(result.is_internal());

        let json = serde_json::to_value(result.redacted()).unwrap();
        assert_eq!(json["reason"], "internal_error");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn duration_is_emitted_in_milliseconds() {
        let result = ExecutionResult {
            duration: Duration::from_millis(1500),
            ..ExecutionResult::internal("x", Duration::ZERO)
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1500);

        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }

    fn completed(stdout: &str, ms: u64) -> ExecutionResult {
        ExecutionResult {
            reason: TerminationReason::Completed,
            stdout: stdout.into(),
            exit_code: Some(0),
            duration: Duration::from_millis(ms),
            error: None,
            ..ExecutionResult::internal("", Duration::ZERO)
        }
    }

    #[test]
    fn report_counts_passed_cases() {
        let report = GradeReport::from_outcomes(vec![
            TestOutcome::judge(&TestCase::new("a", "", "3"), completed("3\n", 10)),
            TestOutcome::judge(&TestCase::new("b", "", "4").hidden(true), completed("3\n", 15)),
        ]);
        assert!(!report.passed);
        assert_eq!(report.summary.passed_count, 1);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.execution_time, Duration::from_millis(25));
        assert!(!report.is_internal());
    }

    #[test]
    fn hint_is_reported_for_failed_cases_only() {
        let case = TestCase::new("a", "", "3").with_hint("add the inputs");
        assert_eq!(TestOutcome::judge(&case, completed("3", 1)).hint, None);
        assert_eq!(
            TestOutcome::judge(&case, completed("4", 1)).hint.as_deref(),
            Some("add the inputs")
        );

        // Matching output from a crashed program is still a failure
        let crashed = ExecutionResult {
            reason: TerminationReason::RuntimeError,
            ..completed("3", 1)
        };
        assert!(!TestOutcome::judge(&case, crashed).passed);
    }

    #[test]
    fn report_uses_backend_field_names() {
        let report = GradeReport::from_outcomes(vec![TestOutcome::judge(
            &TestCase::new("t1", "1 2", "3").hidden(true),
            completed("3\n", 7),
        )]);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["passed"], true);
        assert_eq!(json["summary"]["passedCount"], 1);
        assert_eq!(json["summary"]["total"], 1);
        assert_eq!(json["executionTimeMs"], 7);

        let detail = &json["details"][0];
        assert_eq!(detail["testId"], "t1");
        assert_eq!(detail["isHidden"], true);
        assert_eq!(detail["stdout"], "3\n");
        assert_eq!(detail["stderr"], "");
        assert_eq!(detail["durationMs"], 7);
        assert_eq!(detail["reason"], "completed");
        assert!(detail.get("hint").is_none());
    }

    #[test]
    fn redacted_report_drops_case_diagnostics() {
        let report = GradeReport::from_outcomes(vec![TestOutcome::judge(
            &TestCase::new("a", "", "1"),
            ExecutionResult::internal("spawn failed: EAGAIN", Duration::ZERO),
        )]);
        assert!(report.is_internal());

        let redacted = report.redacted();
        assert!(redacted.details[0].error.is_none());
        assert!(redacted.is_internal());
        assert_eq!(redacted.summary, report.summary);
    }
}
