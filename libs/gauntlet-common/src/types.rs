use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// A user-authored code fragment, owned by exactly one Run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submitter_id: String,
    pub source_text: String,
}

impl Submission {
    pub fn new(submitter_id: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            submitter_id: submitter_id.into(),
            source_text: source_text.into(),
        }
    }
}

/// One decoded input/expected-output pair with a fixed position in the grading order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub ordinal: usize,
    pub input_value: Value,
    pub expected_output: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Unhandled exception raised by the submitted function
    RuntimeError,
    /// Wall-clock timeout or memory ceiling hit during one invocation
    ResourceLimitExceeded,
    /// The sandbox itself misbehaved (daemon error, protocol violation)
    SandboxFailure,
}

/// A per-case fault. Faults are recorded in the outcome, never propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::RuntimeError, message: message.into() }
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::ResourceLimitExceeded, message: message.into() }
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::SandboxFailure, message: message.into() }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// What one invocation produced: a value, or the fault that replaced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actual {
    Value(Value),
    Fault(Fault),
}

impl Actual {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Actual::Value(v) => Some(v),
            Actual::Fault(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub ordinal: usize,
    pub input: Value,
    pub expected: Value,
    pub actual: Actual,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunErrorKind {
    SyntaxError,
    ImportDisallowed,
    FunctionNotFound,
    MalformedPayload,
    NoTestCases,
    SourceTooLarge,
    RuntimeUnavailable,
    /// Shutdown was requested while the Run was in flight
    Cancelled,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failure that ends a Run before (or instead of) grading any test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal state of a Run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    RunError(RunError),
    FirstFailure(ExecutionOutcome),
    AllPassed {
        outcome: ExecutionOutcome,
        elapsed_ms: u64,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::AllPassed { .. })
    }

    pub fn run_error_kind(&self) -> Option<RunErrorKind> {
        match self {
            Verdict::RunError(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl From<RunError> for Verdict {
    fn from(err: RunError) -> Self {
        Verdict::RunError(err)
    }
}

/// Envelope handed back to the caller for one Run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub submitter_id: String,
    pub function: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub verdict: Verdict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_verdict_is_tagged() {
        let verdict = Verdict::RunError(RunError::new(RunErrorKind::NoTestCases, "empty"));
        let encoded = serde_json::to_value(&verdict).unwrap();
        assert_eq!(encoded["verdict"], "run_error");
        assert_eq!(encoded["kind"], "NoTestCases");
    }

    #[test]
    fn test_all_passed_carries_elapsed() {
        let verdict = Verdict::AllPassed {
            outcome: ExecutionOutcome {
                ordinal: 0,
                input: json!([1, 2]),
                expected: json!(3),
                actual: Actual::Value(json!(3)),
                passed: true,
            },
            elapsed_ms: 7,
        };
        let encoded = serde_json::to_value(&verdict).unwrap();
        assert_eq!(encoded["verdict"], "all_passed");
        assert_eq!(encoded["elapsed_ms"], 7);
        assert_eq!(encoded["outcome"]["actual"]["value"], 3);
        assert!(verdict.is_pass());
    }

    #[test]
    fn test_fault_serializes_with_kind() {
        let actual = Actual::Fault(Fault::resource_limit("timed out after 2000ms"));
        let encoded = serde_json::to_value(&actual).unwrap();
        assert_eq!(encoded["fault"]["kind"], "resource_limit_exceeded");
        assert!(actual.as_value().is_none());
    }
}
