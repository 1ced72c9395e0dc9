use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/* ---------- conversation ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/* ---------- target ---------- */

/// 1-based inclusive line range of an object inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpan {
    pub start: u32,
    pub end: u32,
}

impl LineSpan {
    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

/// Function or method selected for testing. Produced by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetObject {
    pub name: String,
    pub class_name: Option<String>,
    /// Module path relative to the project root.
    pub source_path: PathBuf,
    pub span: LineSpan,
    pub source: String,
    #[serde(default)]
    pub info_sheet: Vec<String>,
}

impl TargetObject {
    pub fn id(&self) -> String {
        let path = self.source_path.to_string_lossy().replace('\\', "/");
        match &self.class_name {
            Some(cls) => format!("{path}::{cls}.{}", self.name),
            None => format!("{path}::{}", self.name),
        }
    }

    /// Dotted module name: `pkg/accounts.py` -> `pkg.accounts`.
    pub fn module_name(&self) -> String {
        module_name_for(&self.source_path)
    }

    /// Name the generated test has to import.
    pub fn import_name(&self) -> &str {
        self.class_name.as_deref().unwrap_or(&self.name)
    }

    pub fn kind_label(&self) -> &'static str {
        if self.class_name.is_some() {
            "Method"
        } else {
            "Function"
        }
    }
}

pub fn module_name_for(path: &Path) -> String {
    let stem = path.with_extension("");
    stem.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/* ---------- generation config ---------- */

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub n_samples: u32,
    pub max_iter: u32,
    pub model_id: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            n_samples: 1,
            max_iter: 5,
            model_id: DEFAULT_MODEL.to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.n_samples < 1 {
            return Err(ConfigError::Invalid("n_samples must be >= 1".into()));
        }
        if self.max_iter < 1 {
            return Err(ConfigError::Invalid("max_iter must be >= 1".into()));
        }
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::Invalid("model_id cannot be empty".into()));
        }
        Ok(())
    }

    /// Same settings, one sample. Used for the consolidation request.
    pub fn single_sample(&self) -> Self {
        Self {
            n_samples: 1,
            ..self.clone()
        }
    }
}

/* ---------- execution ---------- */

#[derive(Debug, Clone)]
pub struct Candidate {
    pub sample_index: usize,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_id: String,
    pub message: String,
}

/// Line coverage for the whole module under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub executed: BTreeSet<u32>,
    pub missing: BTreeSet<u32>,
}

impl Coverage {
    /// Integer percentage of the span's measurable lines that were executed.
    pub fn percent_within(&self, span: LineSpan) -> u32 {
        let hit = self.executed.iter().filter(|l| span.contains(**l)).count();
        let miss = self
            .missing
            .iter()
            .filter(|l| span.contains(**l) && !self.executed.contains(*l))
            .count();
        if hit + miss == 0 {
            return 0;
        }
        (hit * 100 / (hit + miss)) as u32
    }

    pub fn merge(&mut self, other: &Coverage) {
        self.executed.extend(other.executed.iter().copied());
        self.missing.extend(other.missing.iter().copied());
        let executed = self.executed.clone();
        self.missing.retain(|l| !executed.contains(l));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub passed: bool,
    pub tests_run: u32,
    pub failures: Vec<TestFailure>,
    pub compile_error: Option<String>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub coverage: Coverage,
    pub error_trace: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A run that hit the wall-clock limit. Counts as a failed candidate.
    pub fn timed_out(limit_secs: u64, stdout: String, stderr: String) -> Self {
        Self {
            passed: false,
            tests_run: 0,
            failures: Vec::new(),
            compile_error: None,
            timed_out: true,
            stdout,
            stderr,
            coverage: Coverage::default(),
            error_trace: Some(format!(
                "Test execution exceeded the time limit of {limit_secs}s. \
                 Avoid infinite loops, blocking calls and network access."
            )),
            duration_ms: limit_secs * 1000,
        }
    }
}

/* ---------- records ---------- */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub object_id: String,
    pub target: TargetObject,
    pub test_source: String,
    pub result: ExecutionResult,
    pub iteration_count: u32,
    pub accepted: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/* ---------- pipeline ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Sampling,
    Executing,
    Summarizing,
    Evaluating,
    Retry,
    Accepted,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Incremental updates for whoever drives the pipeline (CLI, UI).
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Log(LogLevel, String),
    PhaseChanged { phase: Phase, iteration: u32 },
    MessageAppended(Message),
    SampleExecuted { sample_index: usize, source: String, passed: bool },
    IterationFinished { iteration: u32, result: ExecutionResult },
    Finished(Verdict),
    Aborted(String),
}
