//! logger.rs
//!
//! Tracing setup and terminal rendering of pipeline events.

use tracing_subscriber::EnvFilter;

use crate::state::{LogLevel, Phase, PipelineEvent, Role};

pub const LOG_ENV: &str = "TESTSMITH_LOG";

/// Installs the global subscriber. Filter comes from `TESTSMITH_LOG`,
/// default `info`. Safe to call more than once.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn tag(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "[info]",
        LogLevel::Success => "[ ok ]",
        LogLevel::Warn => "[warn]",
        LogLevel::Error => "[fail]",
    }
}

/// One line per event. `None` for events the terminal does not show.
pub fn render(event: &PipelineEvent, show_messages: bool) -> Option<String> {
    match event {
        PipelineEvent::Log(level, text) => Some(format!("{} {text}", tag(level))),
        PipelineEvent::PhaseChanged { phase, iteration } => match phase {
            Phase::Sampling => Some(format!("{} iteration {iteration}: requesting completions", tag(&LogLevel::Info))),
            Phase::Summarizing => Some(format!("{} iteration {iteration}: combining samples", tag(&LogLevel::Info))),
            Phase::Retry => Some(format!("{} iteration {iteration} failed, reprompting", tag(&LogLevel::Warn))),
            _ => None,
        },
        PipelineEvent::MessageAppended(msg) if show_messages => {
            Some(format!("--- {} ---\n{}", msg.role.as_str(), msg.content))
        }
        PipelineEvent::MessageAppended(msg) if msg.role == Role::Assistant => {
            Some(format!("{} received candidate ({} lines)", tag(&LogLevel::Info), msg.content.lines().count()))
        }
        PipelineEvent::MessageAppended(_) => None,
        PipelineEvent::SampleExecuted { sample_index, passed, .. } => {
            let level = if *passed { LogLevel::Success } else { LogLevel::Warn };
            let word = if *passed { "passed" } else { "failed" };
            Some(format!("{} sample {} {word}", tag(&level), sample_index + 1))
        }
        PipelineEvent::IterationFinished { iteration, result } => {
            let level = if result.passed { LogLevel::Success } else { LogLevel::Warn };
            let mut line = format!(
                "{} iteration {iteration}: {} test(s) run, {} failure(s)",
                tag(&level),
                result.tests_run,
                result.failures.len()
            );
            if result.compile_error.is_some() {
                line.push_str(", compile error");
            }
            if result.timed_out {
                line.push_str(", timed out");
            }
            Some(line)
        }
        PipelineEvent::Finished(_) => None,
        PipelineEvent::Aborted(reason) => Some(format!("{} aborted: {reason}", tag(&LogLevel::Error))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionResult, Message};

    #[test]
    fn renders_iteration_summary() {
        let result = ExecutionResult::timed_out(30, String::new(), String::new());
        let line = render(&PipelineEvent::IterationFinished { iteration: 2, result }, false).unwrap();
        assert!(line.starts_with("[warn] iteration 2"));
        assert!(line.ends_with("timed out"));
    }

    #[test]
    fn prompts_hidden_unless_requested() {
        let ev = PipelineEvent::MessageAppended(Message::new(Role::User, "hello"));
        assert!(render(&ev, false).is_none());
        assert_eq!(render(&ev, true).unwrap(), "--- user ---\nhello");
    }
}
