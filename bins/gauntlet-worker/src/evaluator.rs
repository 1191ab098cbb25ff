/// Grader - Fail-Fast Test Runner
///
/// **Core Responsibility:**
/// Drive one isolated runtime across the ordered test cases and produce the Run verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or processes (talks to `IsolatedRuntime`)
/// - Strictly sequential, ascending ordinal order
/// - Stops at the first failing case; later cases are never invoked
/// - Faults (exception, timeout, memory) are failing outcomes, not errors
///
/// **Comparison Rules:**
/// - Structural equality over decoded JSON values
/// - Numbers compare by value: `3 == 3.0`; integers compare exactly at any
///   size, and an integer equals a float only if the float is exactly that integer
/// - Object key order ignored, array order significant
/// - Booleans never equal numbers
/// - Floating-point tolerance: off unless `float_tolerance` is configured,
///   then relative to `max(1, |a|, |b|)`

use crate::engine::{Invocation, IsolatedRuntime};
use crate::timing::Stopwatch;
use gauntlet_common::types::{Actual, ExecutionOutcome, RunError, RunErrorKind, TestCase, Verdict};
use serde_json::{Number, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct ComparisonPolicy {
    pub float_tolerance: Option<f64>,
}

pub fn values_equal(actual: &Value, expected: &Value, policy: &ComparisonPolicy) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b, policy.float_tolerance),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y, policy))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| values_equal(v, w, policy)))
        }
        _ => actual == expected,
    }
}

fn numbers_equal(a: &Number, b: &Number, tolerance: Option<f64>) -> bool {
    let (int_a, int_b) = (integer_digits(a), integer_digits(b));
    if let (Some(x), Some(y)) = (&int_a, &int_b) {
        return x == y;
    }

    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return false;
    };
    if let Some(tol) = tolerance {
        return (x - y).abs() <= tol * 1f64.max(x.abs()).max(y.abs());
    }
    match (int_a, int_b) {
        (Some(int), None) => integral_digits(y).is_some_and(|f| f == int),
        (None, Some(int)) => integral_digits(x).is_some_and(|f| f == int),
        _ => x == y,
    }
}

/// Canonical decimal digits of an integer literal; `None` for fractions and exponents
///
/// Relies on `arbitrary_precision`, so integers past u64 keep every digit.
fn integer_digits(n: &Number) -> Option<String> {
    let text = n.to_string();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits = digits.trim_start_matches('0');
    Some(match (negative, digits.is_empty()) {
        (_, true) => "0".to_string(),
        (true, false) => format!("-{}", digits),
        (false, false) => digits.to_string(),
    })
}

/// Exact decimal expansion of an integral float
fn integral_digits(f: f64) -> Option<String> {
    if !f.is_finite() || f.fract() != 0.0 {
        return None;
    }
    let text = format!("{:.0}", f);
    Some(if text == "-0" { "0".to_string() } else { text })
}

/// Turn one invocation into an outcome for its test case
pub fn evaluate_case(case: &TestCase, invocation: Invocation, policy: &ComparisonPolicy) -> ExecutionOutcome {
    let (actual, passed) = match invocation {
        Invocation::Returned(value) => {
            let passed = values_equal(&value, &case.expected_output, policy);
            (Actual::Value(value), passed)
        }
        Invocation::Faulted(fault) => (Actual::Fault(fault), false),
    };

    ExecutionOutcome {
        ordinal: case.ordinal,
        input: case.input_value.clone(),
        expected: case.expected_output.clone(),
        actual,
        passed,
    }
}

/// Grade the cases in order, stopping at the first failure
///
/// `elapsed_ms` covers the whole loop, from the first invocation to the last.
pub async fn grade(
    runtime: &mut dyn IsolatedRuntime,
    cases: &[TestCase],
    policy: &ComparisonPolicy,
) -> Verdict {
    let stopwatch = Stopwatch::start();
    let mut last = None;

    for case in cases {
        let invocation = runtime.invoke(&case.input_value).await;
        let outcome = evaluate_case(case, invocation, policy);

        debug!(ordinal = outcome.ordinal, passed = outcome.passed, "Test case evaluated");

        if !outcome.passed {
            info!(
                ordinal = outcome.ordinal,
                executed = outcome.ordinal + 1,
                total = cases.len(),
                "First failure; stopping"
            );
            return Verdict::FirstFailure(outcome);
        }
        last = Some(outcome);
    }

    let Some(outcome) = last else {
        return Verdict::RunError(empty_suite());
    };

    let elapsed_ms = stopwatch.elapsed_ms();
    info!(total = cases.len(), elapsed_ms, "All test cases passed");
    Verdict::AllPassed { outcome, elapsed_ms }
}

pub fn empty_suite() -> RunError {
    RunError::new(RunErrorKind::NoTestCases, "test-case sequence is empty")
}
