//! error.rs
//!
//! Error taxonomy shared by the sandbox, the completion client, the store
//! and the generation pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::{ExecutionResult, Message, Phase, TokenUsage};

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Engine unreachable, image missing, or container could not be created.
    #[error("execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// The runner exceeded its wall-clock limit.
    #[error("test run exceeded {}s", .limit.as_secs())]
    ExecutionTimeout { limit: Duration, stdout: String, stderr: String },

    /// Runner crashed or produced no readable report. Not a test failure.
    #[error("execution error (exit {exit_code:?}): {message}")]
    ExecutionError { exit_code: Option<i32>, message: String },

    #[error("sandbox session is stopped")]
    Stopped,

    #[error("sandbox io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion service rejected credentials: {0}")]
    Auth(String),

    #[error("completion service rate limit: {0}")]
    RateLimit(String),

    #[error("network error talking to completion service: {0}")]
    Network(String),

    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    #[error("completion service error {status}: {body}")]
    Service { status: u16, body: String },

    #[error("completion client not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {record_id} not found for {object_id}")]
    NotFound { object_id: String, record_id: String },

    #[error("store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid generation config: {0}")]
    Invalid(String),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config encode: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported source file: {0}")]
    Unsupported(PathBuf),

    #[error("failed to parse {0}")]
    Syntax(PathBuf),

    #[error("{path} is outside the project root")]
    OutsideProject { path: PathBuf },
}

/// Startup or shutdown of the application shell.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a pipeline run stopped without reaching Accepted or Exhausted.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("{0}")]
    Environment(String),

    #[error("{0}")]
    Execution(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run cancelled")]
    Cancelled,
}

impl From<SandboxError> for FatalError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::EnvironmentUnavailable(_) | SandboxError::Stopped => {
                FatalError::Environment(e.to_string())
            }
            other => FatalError::Execution(other.to_string()),
        }
    }
}

/// A fatal pipeline termination, with enough context to resume manually.
#[derive(Debug, Error)]
#[error("generation aborted during {phase:?} (iteration {iteration}): {cause}")]
pub struct RunAborted {
    pub phase: Phase,
    pub iteration: u32,
    #[source]
    pub cause: FatalError,
    pub messages: Vec<Message>,
    pub last_result: Option<ExecutionResult>,
    /// Tokens spent before the abort.
    pub usage: TokenUsage,
}
