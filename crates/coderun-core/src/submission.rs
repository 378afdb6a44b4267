//! Submission types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::CoderunError;

/// Target language of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "golang")]
    Go,
    #[serde(alias = "py", alias = "python3")]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
}

impl Language {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = CoderunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "go" | "golang" => Ok(Self::Go),
            "python" | "python3" | "py" => Ok(Self::Python),
            "javascript" | "js" | "node" => Ok(Self::JavaScript),
            other => Err(CoderunError::Protocol(format!("unsupported language: {other}"))),
        }
    }
}

/// Resource limits requested by the backend
///
/// Missing values fall back to the policy defaults; present values are
/// clamped to the policy ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Wall-clock limit of the run step in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,

    /// Address-space ceiling of the run step in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
}

impl Limits {
    #[must_use]
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_ms.map(Duration::from_millis)
    }
}

/// One stdin/expected-stdout pair of a graded submission
///
/// Also accepts the backend's lesson format (`input`, `expectedOutput`,
/// `isHidden`, `hint`), whose values may be any JSON; non-string values
/// stand for their compact JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,

    #[serde(default, alias = "input", deserialize_with = "json_text::optional")]
    pub stdin: Option<String>,

    /// Compared against the program's stdout with surrounding whitespace trimmed
    #[serde(alias = "expectedOutput", deserialize_with = "json_text::required")]
    pub expected_stdout: String,

    #[serde(default, alias = "isHidden")]
    pub hidden: bool,

    /// Reported back with the case when it fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl TestCase {
    #[must_use]
    pub fn new(id: impl Into<String>, stdin: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stdin: Some(stdin.into()),
            expected_stdout: expected.into(),
            hidden: false,
            hint: None,
        }
    }

    #[must_use]
    pub const fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Whether `stdout` is the expected output, ignoring surrounding whitespace
    #[must_use]
    pub fn matches(&self, stdout: &str) -> bool {
        stdout.trim() == self.expected_stdout.trim()
    }
}

/// Strings as-is, any other JSON value as its compact text
mod json_text {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn text(value: Value) -> String {
        match value {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Value::deserialize(d).map(text)
    }

    pub fn optional<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            value => Some(text(value)),
        })
    }
}

/// One unit of untrusted source code plus its execution parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub language: Language,

    #[serde(alias = "code")]
    pub source: String,

    /// Absent stdin is an empty input stream
    #[serde(default)]
    pub stdin: Option<String>,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestCase>,
}

impl Submission {
    #[must_use]
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
            stdin: None,
            limits: Limits::default(),
            tests: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub const fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.limits.time_limit_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_limit_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_test(mut self, test: TestCase) -> Self {
        self.tests.push(test);
        self
    }

    #[must_use]
    pub fn is_graded(&self) -> bool {
        !self.tests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_aliases() {
        assert_eq!("golang".parse::<Language>().unwrap(), Language::Go);
        assert_eq!("JS".parse::<Language>().unwrap(), Language::JavaScript);
        assert!("cobol".parse::<Language>().is_err());

        let lang: Language = serde_json::from_str("\"py\"").unwrap();
        assert_eq!(lang, Language::Python);
    }

    #[test]
    fn minimal_submission_decodes_with_defaults() {
        let sub: Submission =
            serde_json::from_str(r#"{"language":"go","source":"package main"}"#).unwrap();
        assert_eq!(sub.language, Language::Go);
        assert!(sub.stdin.is_none());
        assert_eq!(sub.limits, Limits::default());
        assert!(!sub.is_graded());
    }

    #[test]
    fn backend_lesson_tests_decode() {
        let sub: Submission = serde_json::from_str(
            r#"{"language":"go","code":"x","tests":[
                {"id":"t1","description":"Add","input":"1 2","expectedOutput":"3","isHidden":false},
                {"id":"t2","input":[10,5],"expectedOutput":15,"isHidden":true,"hint":"check overflow"},
                {"id":"t3","input":null,"expectedOutput":{"a":2}}
            ]}"#,
        )
        .unwrap();

        let [t1, t2, t3] = sub.tests.as_slice() else {
            panic!("expected three cases, got {:?}", sub.tests);
        };
        assert_eq!(t1.stdin.as_deref(), Some("1 2"));
        assert_eq!(t1.expected_stdout, "3");
        assert!(!t1.hidden);

        assert_eq!(t2.stdin.as_deref(), Some("[10,5]"));
        assert_eq!(t2.expected_stdout, "15");
        assert!(t2.hidden);
        assert_eq!(t2.hint.as_deref(), Some("check overflow"));

        assert_eq!(t3.stdin, None);
        assert_eq!(t3.expected_stdout, r#"{"a":2}"#);
    }

    #[test]
    fn expected_output_ignores_surrounding_whitespace() {
        let case = TestCase::new("a", "", "  42\n");
        assert!(case.matches("42\n\n"));
        assert!(!case.matches("4 2"));
    }

    #[test]
    fn backend_payload_uses_code_field() {
        let sub: Submission = serde_json::from_str(
            r#"{"language":"go","code":"x","tests":[{"id":"a","expected_stdout":"1"}]}"#,
        )
        .unwrap();
        assert_eq!(sub.source, "x");
        assert_eq!(sub.tests.len(), 1);
        assert!(!sub.tests[0].hidden);
    }
}
