/// Execution Engine - Isolated Runtime Abstraction
///
/// **Core Responsibility:**
/// Load a validated program into a disposable, per-Run sandbox and invoke its
/// entry point once per test case.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (Docker container, local process)
/// - Engine does NOT compare outputs or decide verdicts
/// - Engine converts every per-invocation failure into an `Invocation`, never an `Err`
///
/// **Isolation Rules:**
/// - One runtime per Run, named by submitter AND run id
/// - Runtimes are never shared or reused
/// - Backing resources are released on every exit path (explicit `release`,
///   with a drop guard behind it for cancellation and panics)

use crate::validator::Program;
use anyhow::Result;
use async_trait::async_trait;
use gauntlet_common::types::Fault;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Trusted script that loads the submission and calls the entry point
pub const HARNESS_SOURCE: &str = include_str!("../harness/harness.py");

/// Identity of one Run; used only to name and label sandbox resources
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub submitter_id: String,
}

impl RunContext {
    pub fn new(submitter_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            submitter_id: submitter_id.into(),
        }
    }

    /// Unique, filesystem- and container-safe name for this Run's sandbox
    pub fn sandbox_name(&self) -> String {
        let submitter: String = self
            .submitter_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(32)
            .collect();
        format!("gauntlet-{}-{}", submitter, self.run_id)
    }
}

/// Result of calling the entry point once
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Returned(Value),
    Faulted(Fault),
}

#[async_trait]
pub trait IsolatedRuntime: Send {
    /// Invoke the entry point with one argument. Never fails; faults are data.
    async fn invoke(&mut self, input: &Value) -> Invocation;

    /// Tear down all backing resources
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Creates one fresh runtime per Run
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn acquire(&self, run: &RunContext, program: &Program) -> Result<Box<dyn IsolatedRuntime>>;
}

/// Report written by the harness on its real stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HarnessReport {
    Returned { value: Value },
    Raised { error: String },
    MemoryExceeded { error: String },
}

/// Raw process result of one harness run, independent of backend
#[derive(Debug, Default)]
pub struct HarnessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

/// Exit code of a process killed by SIGKILL (OOM killer, hard kill)
const EXIT_KILLED: i64 = 137;

/// Classify a completed harness run into an `Invocation`
pub fn interpret(output: &HarnessOutput) -> Invocation {
    match serde_json::from_str::<HarnessReport>(output.stdout.trim()) {
        Ok(HarnessReport::Returned { value }) => Invocation::Returned(value),
        Ok(HarnessReport::Raised { error }) => Invocation::Faulted(Fault::runtime(error)),
        Ok(HarnessReport::MemoryExceeded { error }) => Invocation::Faulted(Fault::resource_limit(error)),
        Err(_) if output.exit_code == Some(EXIT_KILLED) => Invocation::Faulted(Fault::resource_limit(
            "process killed: memory ceiling exceeded",
        )),
        Err(e) => {
            let detail = output
                .stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("malformed harness report: {}", e));
            match output.exit_code {
                Some(code) if code != 0 => {
                    Invocation::Faulted(Fault::runtime(format!("exit code {}: {}", code, detail)))
                }
                _ => Invocation::Faulted(Fault::sandbox(detail)),
            }
        }
    }
}

pub fn timeout_fault(timeout_ms: u64) -> Invocation {
    Invocation::Faulted(Fault::resource_limit(format!(
        "execution timed out after {}ms",
        timeout_ms
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_common::types::FaultKind;
    use serde_json::json;

    fn output(stdout: &str, stderr: &str, exit_code: Option<i64>) -> HarnessOutput {
        HarnessOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    fn fault_kind(invocation: Invocation) -> FaultKind {
        match invocation {
            Invocation::Faulted(f) => f.kind,
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_sandbox_names_are_unique_per_run() {
        let a = RunContext::new("user/42");
        let b = RunContext::new("user/42");
        assert_ne!(a.sandbox_name(), b.sandbox_name());
        assert!(a.sandbox_name().starts_with("gauntlet-user_42-"));
    }

    #[test]
    fn test_interpret_returned() {
        let out = output("{\"status\": \"returned\", \"value\": [1, 2]}\n", "", Some(0));
        assert_eq!(interpret(&out), Invocation::Returned(json!([1, 2])));
    }

    #[test]
    fn test_interpret_raised() {
        let out = output(r#"{"status": "raised", "error": "ZeroDivisionError: division by zero"}"#, "", Some(0));
        match interpret(&out) {
            Invocation::Faulted(f) => {
                assert_eq!(f.kind, FaultKind::RuntimeError);
                assert!(f.message.contains("ZeroDivisionError"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_interpret_memory() {
        let out = output(r#"{"status": "memory_exceeded", "error": "MemoryError"}"#, "", Some(0));
        assert_eq!(fault_kind(interpret(&out)), FaultKind::ResourceLimitExceeded);
        assert_eq!(fault_kind(interpret(&output("", "", Some(137)))), FaultKind::ResourceLimitExceeded);
    }

    #[test]
    fn test_interpret_crash_and_garbage() {
        let crashed = output("", "Traceback...\nSystemError: boom\n", Some(1));
        match interpret(&crashed) {
            Invocation::Faulted(f) => {
                assert_eq!(f.kind, FaultKind::RuntimeError);
                assert!(f.message.contains("SystemError: boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fault_kind(interpret(&output("not json", "", Some(0)))), FaultKind::SandboxFailure);
    }

    #[test]
    fn test_timeout_fault() {
        assert_eq!(fault_kind(timeout_fault(10)), FaultKind::ResourceLimitExceeded);
    }
}
