//! Machine-readable report written by `assets/run_tests.py`.

use serde::Deserialize;

use crate::error::SandboxError;
use crate::llm::prompt::excerpt;
use crate::state::{Coverage, ExecutionResult, TestFailure};

const OUTPUT_LIMIT: usize = 10_000;
pub const INTERRUPTED_TEST_ID: &str = "<test process>";

#[derive(Debug, Deserialize)]
pub struct RunnerReport {
    #[serde(default)]
    pub tests_run: u32,
    #[serde(default)]
    pub errors: Vec<(String, String)>,
    #[serde(default)]
    pub failures: Vec<(String, String)>,
    #[serde(default)]
    pub executed_lines: Vec<u32>,
    #[serde(default)]
    pub missing_lines: Vec<u32>,
    #[serde(default)]
    pub compile_error: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Left set when the runner died before finishing the suite.
    #[serde(default)]
    pub interrupted: Option<String>,
}

pub fn parse_report(raw: &str) -> Result<RunnerReport, SandboxError> {
    serde_json::from_str(raw.trim()).map_err(|e| SandboxError::ExecutionError {
        exit_code: Some(0),
        message: format!("runner report unreadable: {e}"),
    })
}

impl RunnerReport {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.is_some()
    }

    pub fn into_result(self, duration_ms: u64) -> ExecutionResult {
        let mut failures: Vec<TestFailure> = self
            .errors
            .into_iter()
            .chain(self.failures)
            .map(|(test_id, message)| TestFailure { test_id, message })
            .collect();
        if let Some(reason) = self.interrupted {
            failures.push(TestFailure {
                test_id: INTERRUPTED_TEST_ID.into(),
                message: reason,
            });
        }

        let passed = self.compile_error.is_none() && failures.is_empty() && self.tests_run > 0;

        let error_trace = if let Some(err) = &self.compile_error {
            Some(err.clone())
        } else if !failures.is_empty() {
            Some(
                failures
                    .iter()
                    .map(|f| format!("{}\n{}", f.test_id, f.message.trim_end()))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            )
        } else if self.tests_run == 0 {
            Some("No tests were collected. Define unittest.TestCase subclasses with test_* methods.".into())
        } else {
            None
        };

        ExecutionResult {
            passed,
            tests_run: self.tests_run,
            failures,
            compile_error: self.compile_error,
            timed_out: false,
            stdout: excerpt(&self.stdout, OUTPUT_LIMIT),
            stderr: excerpt(&self.stderr, OUTPUT_LIMIT),
            coverage: Coverage {
                executed: self.executed_lines.into_iter().collect(),
                missing: self.missing_lines.into_iter().collect(),
            },
            error_trace,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_report() {
        let raw = r#"{"tests_run": 2, "errors": [], "failures": [],
            "executed_lines": [1, 2, 3], "missing_lines": [4],
            "compile_error": null, "stdout": "", "stderr": "OK"}"#;
        let r = parse_report(raw).unwrap().into_result(12);
        assert!(r.passed);
        assert_eq!(r.tests_run, 2);
        assert_eq!(r.coverage.executed.len(), 3);
        assert!(r.error_trace.is_none());
    }

    #[test]
    fn errors_and_failures_are_merged() {
        let raw = r#"{"tests_run": 3,
            "errors": [["t.A.test_x", "Traceback: NameError"]],
            "failures": [["t.A.test_y", "AssertionError"]],
            "executed_lines": [], "missing_lines": [], "compile_error": null}"#;
        let r = parse_report(raw).unwrap().into_result(0);
        assert!(!r.passed);
        assert_eq!(r.failures.len(), 2);
        assert_eq!(r.failures[0].test_id, "t.A.test_x");
        assert!(r.error_trace.unwrap().contains("AssertionError"));
    }

    #[test]
    fn compile_error_fails_the_run() {
        let raw = r#"{"compile_error": "SyntaxError: invalid syntax (test_source.py, line 3)"}"#;
        let r = parse_report(raw).unwrap().into_result(0);
        assert!(!r.passed);
        assert_eq!(r.error_trace.as_deref(), r.compile_error.as_deref());
    }

    #[test]
    fn empty_suite_does_not_pass() {
        let r = parse_report(r#"{"tests_run": 0}"#).unwrap().into_result(0);
        assert!(!r.passed);
        assert!(r.error_trace.unwrap().contains("No tests"));
    }

    #[test]
    fn interrupted_report_is_a_failure() {
        let raw = r#"{"tests_run": 0, "errors": [], "failures": [],
            "compile_error": null,
            "interrupted": "The test process exited before reporting."}"#;
        let report = parse_report(raw).unwrap();
        assert!(report.is_interrupted());
        let r = report.into_result(0);
        assert!(!r.passed);
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failures[0].test_id, INTERRUPTED_TEST_ID);
        assert!(r.error_trace.unwrap().contains("exited before reporting"));
    }

    #[test]
    fn finished_report_clears_interruption() {
        let raw = r#"{"tests_run": 1, "interrupted": null}"#;
        let report = parse_report(raw).unwrap();
        assert!(!report.is_interrupted());
        assert!(report.into_result(0).passed);
    }

    #[test]
    fn garbage_is_an_execution_error() {
        let err = parse_report("Traceback (most recent call last)").unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionError { .. }));
    }
}
