/// Run Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Take one `(submission, test-case payload)` pair through
/// validate → extract → decode → acquire runtime → grade → release,
/// and wrap the verdict in a `RunReport`.
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How outcomes are compared (evaluator's job)
///
/// Every failure becomes a Run-scoped verdict; nothing here aborts the process.
/// Nothing is acquired until every pre-execution check has passed, and an
/// acquired runtime is released on every path. A cancellation signal stops
/// grading but still awaits the release before the Run returns; the drop
/// guards only cover a Run future that is dropped outright or panics.

use crate::decoder;
use crate::engine::{RunContext, RuntimeProvider};
use crate::evaluator::{self, ComparisonPolicy};
use crate::validator;
use chrono::Utc;
use futures_util::FutureExt;
use gauntlet_common::types::{RunError, RunErrorKind, RunReport, Submission, Verdict};
use std::future::{self, Future};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Grades submissions; cheap to share, safe to call concurrently
#[derive(Clone)]
pub struct Grader {
    provider: Arc<dyn RuntimeProvider>,
    max_source_bytes: usize,
    policy: ComparisonPolicy,
}

impl Grader {
    pub fn new(provider: Arc<dyn RuntimeProvider>, max_source_bytes: usize, policy: ComparisonPolicy) -> Self {
        Self {
            provider,
            max_source_bytes,
            policy,
        }
    }

    /// Grade one submission against its serialized test cases
    pub async fn run(&self, submission: &Submission, test_cases_payload: &str) -> RunReport {
        self.run_until(submission, test_cases_payload, future::pending::<()>()).await
    }

    /// Like `run`, but stops grading once `cancelled` completes
    ///
    /// A cancelled Run ends with `RunError{Cancelled}` after its runtime has been released.
    pub async fn run_until<C>(&self, submission: &Submission, test_cases_payload: &str, cancelled: C) -> RunReport
    where
        C: Future<Output = ()>,
    {
        let run = RunContext::new(&submission.submitter_id);
        let started_at = Utc::now();
        let mut function = None;

        let verdict = self
            .execute(&run, submission, test_cases_payload, &mut function, cancelled)
            .await
            .unwrap_or_else(Verdict::RunError);

        match &verdict {
            Verdict::RunError(e) => warn!(run_id = %run.run_id, kind = %e.kind, message = %e.message, "Run rejected"),
            Verdict::FirstFailure(o) => info!(run_id = %run.run_id, ordinal = o.ordinal, "Run failed"),
            Verdict::AllPassed { elapsed_ms, .. } => info!(run_id = %run.run_id, elapsed_ms, "Run passed"),
        }

        RunReport {
            run_id: run.run_id,
            submitter_id: submission.submitter_id.clone(),
            function,
            started_at,
            finished_at: Utc::now(),
            verdict,
        }
    }

    #[instrument(
        skip_all,
        fields(run_id = %run.run_id, submitter = %run.submitter_id, backend = self.provider.backend())
    )]
    async fn execute<C>(
        &self,
        run: &RunContext,
        submission: &Submission,
        test_cases_payload: &str,
        function: &mut Option<String>,
        cancelled: C,
    ) -> Result<Verdict, RunError>
    where
        C: Future<Output = ()>,
    {
        let program = validator::prepare(&submission.source_text, self.max_source_bytes)?;
        *function = Some(program.entry.name.clone());

        let cases = decoder::decode(test_cases_payload)?;
        if cases.is_empty() {
            return Err(evaluator::empty_suite());
        }

        tokio::pin!(cancelled);
        if (&mut cancelled).now_or_never().is_some() {
            return Err(cancelled_error());
        }

        info!(function = %program.entry.name, test_count = cases.len(), "Submission accepted");

        let mut runtime = self
            .provider
            .acquire(run, &program)
            .await
            .map_err(|e| RunError::new(RunErrorKind::RuntimeUnavailable, format!("{:#}", e)))?;

        // An interrupted invocation is dropped; the runtime itself is still released below
        let verdict = tokio::select! {
            verdict = evaluator::grade(runtime.as_mut(), &cases, &self.policy) => Some(verdict),
            _ = &mut cancelled => {
                warn!("Cancellation requested, stopping grading");
                None
            }
        };

        // Cleanup failures never mask the verdict
        if let Err(e) = runtime.release().await {
            warn!(error = %format!("{:#}", e), "Failed to release runtime");
        }

        verdict.ok_or_else(cancelled_error)
    }
}

fn cancelled_error() -> RunError {
    RunError::new(RunErrorKind::Cancelled, "run cancelled before grading finished")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::ScriptedProvider;
    use crate::engine::Invocation;
    use crate::process::tests::python_available;
    use crate::process::ProcessProvider;
    use gauntlet_common::config::SandboxLimits;
    use gauntlet_common::types::{Actual, Fault, FaultKind};
    use serde_json::{json, Value};
    use std::time::Duration;

    const ADD: &str = "def add(x): return x[0] + x[1]";
    const ONE_CASE: &str = r#"[{"input_data": "[1, 2]", "expected_output": "3"}]"#;
    const TWO_CASES: &str = r#"[{"input_data": "[1, 2]", "expected_output": "3"},
                                 {"input_data": "[2, 2]", "expected_output": "5"}]"#;

    fn add(input: &Value) -> Invocation {
        match (input.get(0).and_then(Value::as_i64), input.get(1).and_then(Value::as_i64)) {
            (Some(a), Some(b)) => Invocation::Returned(json!(a + b)),
            _ => Invocation::Faulted(Fault::runtime("TypeError")),
        }
    }

    fn scripted() -> (Grader, Arc<crate::engine::fake::Counters>) {
        let provider = ScriptedProvider::new(add);
        let counters = provider.counters.clone();
        (Grader::new(Arc::new(provider), 64 * 1024, ComparisonPolicy::default()), counters)
    }

    async fn rejected(source: &str, payload: &str) -> (RunErrorKind, usize) {
        let (grader, counters) = scripted();
        let report = grader.run(&Submission::new("u1", source), payload).await;
        let kind = report.verdict.run_error_kind().expect("run error");
        (kind, counters.acquired())
    }

    #[tokio::test]
    async fn test_all_passed_releases_runtime() {
        let (grader, counters) = scripted();
        let report = grader.run(&Submission::new("u1", ADD), ONE_CASE).await;

        assert!(report.verdict.is_pass());
        assert_eq!(report.function.as_deref(), Some("add"));
        assert_eq!(report.submitter_id, "u1");
        assert!(report.finished_at >= report.started_at);
        assert_eq!(counters.acquired(), 1);
        assert_eq!(counters.released(), 1);
    }

    #[tokio::test]
    async fn test_first_failure_releases_runtime() {
        let (grader, counters) = scripted();
        let report = grader.run(&Submission::new("u1", ADD), TWO_CASES).await;

        match report.verdict {
            Verdict::FirstFailure(o) => {
                assert_eq!(o.ordinal, 1);
                assert_eq!(o.expected, json!(5));
                assert_eq!(o.actual, Actual::Value(json!(4)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(counters.released(), 1);
    }

    #[tokio::test]
    async fn test_rejections_never_acquire_a_runtime() {
        assert_eq!(
            rejected("import os\ndef f(x): return x", ONE_CASE).await,
            (RunErrorKind::ImportDisallowed, 0)
        );
        assert_eq!(
            rejected("def f(x): return x\ndef g(x): return x", ONE_CASE).await,
            (RunErrorKind::FunctionNotFound, 0)
        );
        assert_eq!(rejected("def f(x) return x", ONE_CASE).await, (RunErrorKind::SyntaxError, 0));
        assert_eq!(
            rejected(ADD, r#"[{"input_data": "[1, 2", "expected_output": "3"}]"#).await,
            (RunErrorKind::MalformedPayload, 0)
        );
        assert_eq!(rejected(ADD, "[]").await, (RunErrorKind::NoTestCases, 0));
    }

    #[tokio::test]
    async fn test_unavailable_runtime_is_a_run_error() {
        let mut provider = ScriptedProvider::new(add);
        provider.fail_acquire = true;
        let grader = Grader::new(Arc::new(provider), 1024, ComparisonPolicy::default());

        let report = grader.run(&Submission::new("u1", ADD), ONE_CASE).await;
        assert_eq!(report.verdict.run_error_kind(), Some(RunErrorKind::RuntimeUnavailable));
    }

    #[test]
    fn test_cancelled_run_is_released_before_the_runtime_stops() {
        let mut provider = ScriptedProvider::new(add);
        provider.stall = true;
        let counters = provider.counters.clone();
        let grader = Grader::new(Arc::new(provider), 64 * 1024, ComparisonPolicy::default());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let report = rt.block_on(async {
            let cancelled = tokio::time::sleep(Duration::from_millis(50));
            grader.run_until(&Submission::new("u1", ADD), ONE_CASE, cancelled).await
        });
        drop(rt);

        assert_eq!(report.verdict.run_error_kind(), Some(RunErrorKind::Cancelled));
        assert_eq!(counters.calls().len(), 1);
        assert_eq!(counters.acquired(), 1);
        assert_eq!(counters.released(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_run_never_acquires() {
        let (grader, counters) = scripted();
        let report = grader
            .run_until(&Submission::new("u1", ADD), ONE_CASE, std::future::ready(()))
            .await;

        assert_eq!(report.verdict.run_error_kind(), Some(RunErrorKind::Cancelled));
        assert_eq!(report.function.as_deref(), Some("add"));
        assert_eq!(counters.acquired(), 0);
    }

    fn process_grader(root: &std::path::Path, timeout_ms: u64) -> Grader {
        let limits = SandboxLimits {
            timeout_ms,
            ..SandboxLimits::default()
        };
        let provider = ProcessProvider::new("python3", limits).with_root(root);
        Grader::new(Arc::new(provider), 64 * 1024, ComparisonPolicy::default())
    }

    #[tokio::test]
    async fn test_process_scenarios() {
        if !python_available() {
            eprintln!("python3 not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let grader = process_grader(root.path(), 5000);

        let passed = grader.run(&Submission::new("u1", ADD), ONE_CASE).await;
        match passed.verdict {
            Verdict::AllPassed { outcome, .. } => assert_eq!(outcome.actual, Actual::Value(json!(3))),
            other => panic!("unexpected {other:?}"),
        }

        let failed = grader.run(&Submission::new("u1", ADD), TWO_CASES).await;
        assert!(matches!(failed.verdict, Verdict::FirstFailure(ref o) if o.ordinal == 1));

        let raising = "def inv(x):\n    return 10 // x\n";
        let payload = r#"[{"input_data": "5", "expected_output": "2"},
                          {"input_data": "0", "expected_output": "0"},
                          {"input_data": "1", "expected_output": "10"}]"#;
        match grader.run(&Submission::new("u1", raising), payload).await.verdict {
            Verdict::FirstFailure(o) => {
                assert_eq!(o.ordinal, 1);
                assert!(matches!(o.actual, Actual::Fault(ref f) if f.message.contains("ZeroDivisionError")));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_infinite_loop_is_bounded() {
        if !python_available() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let grader = process_grader(root.path(), 300);
        let source = "def spin(x):\n    while True:\n        pass\n";

        let report = tokio::time::timeout(Duration::from_secs(10), grader.run(&Submission::new("u1", source), ONE_CASE))
            .await
            .expect("run must not hang");

        match report.verdict {
            Verdict::FirstFailure(o) => {
                assert!(matches!(o.actual, Actual::Fault(ref f) if f.kind == FaultKind::ResourceLimitExceeded));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_for_same_submitter_are_isolated() {
        if !python_available() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let grader = process_grader(root.path(), 5000);
        let payload_a = r#"[{"input_data": "0", "expected_output": "\"A\""}]"#;
        let payload_b = r#"[{"input_data": "0", "expected_output": "\"B\""}]"#;
        let sub_a = Submission::new("same-user", "def f(x):\n    return 'A'\n");
        let sub_b = Submission::new("same-user", "def g(x):\n    return 'B'\n");

        let (a, b) = tokio::join!(grader.run(&sub_a, payload_a), grader.run(&sub_b, payload_b));

        assert!(a.verdict.is_pass(), "{:?}", a.verdict);
        assert!(b.verdict.is_pass(), "{:?}", b.verdict);
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_resources() {
        let root = tempfile::tempdir().unwrap();
        let grader = process_grader(root.path(), 30_000);
        let source = "def spin(x):\n    while True:\n        pass\n";
        let submission = Submission::new("u1", source);

        // Without python3 the run ends early with a sandbox fault; either way nothing may remain
        let _ = tokio::time::timeout(Duration::from_millis(300), grader.run(&submission, ONE_CASE)).await;

        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
