//! testgen/aggregator.rs
//!
//! Fan-out/fan-in over the samples of one iteration.

use std::thread;

use tracing::debug;

use crate::error::SandboxError;
use crate::llm::prompt::combine_samples;
use crate::sandbox::TestExecutor;
use crate::state::{Candidate, ExecutionResult, TargetObject};

/// Runs one candidate. Timeouts become failed results so they stay inside
/// the retry loop; every other sandbox error is returned.
pub fn execute<E: TestExecutor + ?Sized>(
    executor: &E,
    source: &str,
    target: &TargetObject,
) -> Result<ExecutionResult, SandboxError> {
    match executor.run(source, target) {
        Err(SandboxError::ExecutionTimeout { limit, stdout, stderr }) => {
            Ok(ExecutionResult::timed_out(limit.as_secs(), stdout, stderr))
        }
        other => other,
    }
}

pub struct SampleAggregator;

impl SampleAggregator {
    /// Executes every candidate concurrently, each in its own sandbox run,
    /// and returns the results in sample order plus the combination prompt.
    pub fn evaluate<E: TestExecutor + ?Sized>(
        candidates: &[Candidate],
        executor: &E,
        target: &TargetObject,
    ) -> Result<(Vec<ExecutionResult>, String), SandboxError> {
        let outcomes: Vec<Result<ExecutionResult, SandboxError>> = thread::scope(|scope| {
            let handles: Vec<_> = candidates
                .iter()
                .map(|c| scope.spawn(move || execute(executor, &c.source, target)))
                .collect();

            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(SandboxError::ExecutionError {
                            exit_code: None,
                            message: "sample worker panicked".into(),
                        })
                    })
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        for (c, outcome) in candidates.iter().zip(outcomes) {
            let r = outcome?;
            debug!(sample = c.sample_index, passed = r.passed, "sample executed");
            results.push(r);
        }

        let summary = combine_samples(candidates, &results);
        Ok((results, summary))
    }
}
