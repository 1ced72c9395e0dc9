//! Accumulated coverage over every stored test of one object.

use serde::Serialize;

use crate::state::{Coverage, LineSpan, TestRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub object_id: String,
    pub n_tests: usize,
    pub tests_run: u32,
    pub failed: usize,
    /// Executed lines inside the object's span.
    pub executed: Vec<u32>,
    /// Lines inside the span no stored test reached.
    pub missing: Vec<u32>,
    pub percent: u32,
}

/// Merges the coverage of `records`, restricted to `span`.
pub fn aggregate(object_id: &str, span: LineSpan, records: &[TestRecord]) -> CoverageReport {
    let mut merged = Coverage::default();
    for r in records {
        merged.merge(&r.result.coverage);
    }

    CoverageReport {
        object_id: object_id.to_string(),
        n_tests: records.len(),
        tests_run: records.iter().map(|r| r.result.tests_run).sum(),
        failed: records.iter().map(|r| r.result.failures.len()).sum(),
        executed: merged.executed.iter().copied().filter(|l| span.contains(*l)).collect(),
        missing: merged.missing.iter().copied().filter(|l| span.contains(*l)).collect(),
        percent: merged.percent_within(span),
    }
}
