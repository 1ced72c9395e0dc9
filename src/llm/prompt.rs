use crate::state::{Candidate, ExecutionResult, TargetObject, TestFailure};

pub const LANGUAGE: &str = "Python";
pub const FRAMEWORK: &str = "unittest";

/// Per-sample error excerpt cap inside the combination prompt.
pub const SUMMARY_EXCERPT_CHARS: usize = 600;
/// Cap on error text fed back after a failed iteration.
pub const FEEDBACK_EXCERPT_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(target: &TargetObject) -> LlmPrompt {
    LlmPrompt {
        system: system_prompt(target),
        user: user_prompt(target),
    }
}

fn system_prompt(target: &TargetObject) -> String {
    let obj_desc = match &target.class_name {
        Some(cls) => format!("method `{}` of class `{cls}`", target.name),
        None => format!("function `{}`", target.name),
    };

    format!(
        "Generate high-quality comprehensive unit tests in {LANGUAGE} using the {FRAMEWORK} \
         library for the provided {obj_desc}.\n\
         Next to the definition you will be provided with a numbered INFO sheet that might be \
         useful in generating finer tests. Use only the relevant parts of it.\n\
         Import the object under test with `from {module} import {import}`.\n\
         The project is mounted read-only: tests must not write files outside a temporary directory.\n\
         Your response should be just valid {LANGUAGE} code without explanation or any other text.",
        module = target.module_name(),
        import = target.import_name(),
    )
}

fn user_prompt(target: &TargetObject) -> String {
    format!(
        "{kind} Definition:\n{source}\n\nINFO sheet:\n{info}",
        kind = target.kind_label(),
        source = target.source.trim_end(),
        info = info_sheet(target),
    )
}

/// Numbered INFO sheet. Always starts with the module location.
pub fn info_sheet(target: &TargetObject) -> String {
    let mut lines = vec![format!(
        "{} is defined in the module called: {}",
        target.kind_label(),
        target.module_name()
    )];
    if let Some(cls) = &target.class_name {
        lines.push(format!("It is a method of class {cls}."));
    }
    lines.extend(target.info_sheet.iter().cloned());

    lines
        .iter()
        .enumerate()
        .map(|(i, l)| format!("{}. {}", i + 1, l))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reprompt after a failed iteration. Compile errors and test errors get
/// different wording.
pub fn feedback_prompt(result: &ExecutionResult) -> String {
    if let Some(err) = &result.compile_error {
        return format!(
            "The code that you have provided failed to compile with the following error:\n{}\n\
             Try to fix the error and resubmit your response.\n\
             Your response should still be just valid {LANGUAGE} code without explanation or any other text.",
            excerpt(err, FEEDBACK_EXCERPT_CHARS)
        );
    }

    let listed = if result.failures.is_empty() {
        let trace = result
            .error_trace
            .clone()
            .unwrap_or_else(|| "no tests were collected".to_string());
        format!("1. {}\n", excerpt(&trace, FEEDBACK_EXCERPT_CHARS))
    } else {
        list_failures(&result.failures)
    };

    format!(
        "While running the tests the following errors occurred:\n{listed}\
         Try to fix them and resubmit your response.\n\
         Your response should still be just valid {LANGUAGE} code without explanation or any other text."
    )
}

pub fn list_failures(failures: &[TestFailure]) -> String {
    let budget = FEEDBACK_EXCERPT_CHARS / failures.len().max(1);
    failures
        .iter()
        .enumerate()
        .map(|(i, f)| {
            format!(
                "{}. Test {} failed with error: {}\n",
                i + 1,
                f.test_id,
                excerpt(&f.message, budget)
            )
        })
        .collect()
}

/// Deterministic digest of every sample's outcome, in sample order.
pub fn combine_samples(candidates: &[Candidate], results: &[ExecutionResult]) -> String {
    let mut s = format!(
        "{} candidate test suites were generated and executed independently.\n\n",
        candidates.len()
    );

    for (c, r) in candidates.iter().zip(results) {
        s.push_str(&format!("### Sample {}\n", c.sample_index + 1));
        s.push_str("```python\n");
        s.push_str(c.source.trim_end());
        s.push_str("\n```\n");
        s.push_str(&format!("Outcome: {}\n", outcome_line(r)));
        if !r.passed {
            if let Some(err) = failure_excerpt(r) {
                s.push_str(&format!("Error excerpt:\n{}\n", excerpt(&err, SUMMARY_EXCERPT_CHARS)));
            }
        }
        s.push('\n');
    }

    s.push_str(&format!(
        "Using what worked and avoiding what failed, combine these samples into one final \
         test suite.\nYour response should be just valid {LANGUAGE} code without explanation \
         or any other text."
    ));
    s
}

fn outcome_line(r: &ExecutionResult) -> String {
    if r.passed {
        format!("PASSED ({} tests)", r.tests_run)
    } else if r.timed_out {
        "FAILED (timed out)".to_string()
    } else if r.compile_error.is_some() {
        "FAILED (did not compile)".to_string()
    } else {
        format!("FAILED ({} of {} tests failed)", r.failures.len(), r.tests_run)
    }
}

fn failure_excerpt(r: &ExecutionResult) -> Option<String> {
    r.compile_error
        .clone()
        .or_else(|| {
            r.failures
                .first()
                .map(|f| format!("{}: {}", f.test_id, f.message))
        })
        .or_else(|| r.error_trace.clone())
}

/// Keeps the tail: tracebacks put the useful line last.
pub fn excerpt(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= limit {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - limit).collect();
    format!("...{tail}")
}
