pub mod client;
pub mod prompt;

pub use client::{Completer, Completion, LlmClient, Provider, ProviderConfig};
