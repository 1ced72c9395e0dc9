// src/llm/client.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::CompletionError;
use crate::state::{GenerationConfig, Message, Role, TokenUsage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const ANTHROPIC_MAX_TOKENS: u32 = 4096;

/// Texts ordered by sample index, plus the tokens the request consumed.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub texts: Vec<String>,
    pub usage: TokenUsage,
}

/// Chat-style completion endpoint. Stateless: output depends only on the
/// messages and config passed in. Errors are never retried here.
pub trait Completer: Send + Sync {
    fn complete(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> Result<Completion, CompletionError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "anthropic" => Some(Provider::Anthropic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub provider: Provider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

pub struct LlmClient {
    cfg: ProviderConfig,
    http: reqwest::blocking::Client,
}

impl LlmClient {
    pub fn new(cfg: ProviderConfig) -> Result<Self, CompletionError> {
        if cfg.api_key.trim().is_empty() {
            return Err(CompletionError::NotConfigured(
                "API key is empty. Run `testsmith configure` or set OPENAI_API_KEY".into(),
            ));
        }

        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        Ok(Self { cfg, http })
    }

    pub fn provider(&self) -> Provider {
        self.cfg.provider
    }

    fn post(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<Value, CompletionError> {
        let mut req = self.http.post(url).json(body);
        for (k, v) in headers {
            req = req.header(*k, v);
        }

        let resp = req.send().map_err(|e| CompletionError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), text));
        }

        serde_json::from_str(&text).map_err(|e| CompletionError::MalformedResponse(e.to_string()))
    }

    fn complete_openai(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> Result<Completion, CompletionError> {
        let url = self
            .cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".into());

        let body = json!({
            "model": config.model_id,
            "messages": wire_messages(messages),
            "temperature": config.temperature,
            "n": config.n_samples,
        });

        let json = self.post(
            &url,
            &[("Authorization", format!("Bearer {}", self.cfg.api_key))],
            &body,
        )?;

        let texts = extract_openai_choices(&json, config.n_samples as usize)?;
        let usage = TokenUsage {
            input_tokens: json.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: json
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };

        Ok(Completion { texts, usage })
    }

    /// The messages API has no `n`, so each sample is its own request.
    fn complete_anthropic(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> Result<Completion, CompletionError> {
        let url = self
            .cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into());

        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let turns: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        let body = json!({
            "model": config.model_id,
            "max_tokens": ANTHROPIC_MAX_TOKENS,
            "temperature": config.temperature,
            "system": system,
            "messages": wire_messages(&turns),
        });
        let headers = [
            ("x-api-key", self.cfg.api_key.clone()),
            ("anthropic-version", "2023-06-01".to_string()),
        ];

        let mut out = Completion::default();
        for sample in 0..config.n_samples {
            debug!(sample, "anthropic sample request");
            let json = self.post(&url, &headers, &body)?;
            let text = json
                .pointer("/content/0/text")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| CompletionError::MalformedResponse("missing content[0].text".into()))?;
            out.texts.push(text);
            out.usage.add(TokenUsage {
                input_tokens: json.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: json.pointer("/usage/output_tokens").and_then(Value::as_u64).unwrap_or(0),
            });
        }
        Ok(out)
    }
}

impl Completer for LlmClient {
    fn complete(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> Result<Completion, CompletionError> {
        debug!(
            model = %config.model_id,
            n = config.n_samples,
            messages = messages.len(),
            "completion request"
        );
        match self.cfg.provider {
            Provider::OpenAI => self.complete_openai(messages, config),
            Provider::Anthropic => self.complete_anthropic(messages, config),
        }
    }
}

fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

/// Choices ordered by their `index`, checked against the requested count.
fn extract_openai_choices(v: &Value, expected: usize) -> Result<Vec<String>, CompletionError> {
    let choices = v
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| CompletionError::MalformedResponse("missing choices".into()))?;

    let mut indexed = Vec::with_capacity(choices.len());
    for (pos, c) in choices.iter().enumerate() {
        let idx = c.get("index").and_then(Value::as_u64).map(|i| i as usize).unwrap_or(pos);
        let text = c
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| CompletionError::MalformedResponse(format!("choice {idx} has no content")))?;
        indexed.push((idx, text.to_string()));
    }
    indexed.sort_by_key(|(i, _)| *i);

    if indexed.len() != expected {
        return Err(CompletionError::MalformedResponse(format!(
            "expected {expected} choices, got {}",
            indexed.len()
        )));
    }

    Ok(indexed.into_iter().map(|(_, t)| t).collect())
}

fn classify_status(status: u16, body: String) -> CompletionError {
    match status {
        401 | 403 => CompletionError::Auth(body),
        429 => CompletionError::RateLimit(body),
        _ => CompletionError::Service { status, body },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choices_are_ordered_by_index() {
        let v = json!({
            "choices": [
                { "index": 1, "message": { "content": "second" } },
                { "index": 0, "message": { "content": "first" } }
            ]
        });
        let texts = extract_openai_choices(&v, 2).unwrap();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn missing_choices_is_malformed() {
        let err = extract_openai_choices(&json!({}), 1).unwrap_err();
        assert!(matches!(err, CompletionError::MalformedResponse(_)));
    }

    #[test]
    fn wrong_choice_count_is_malformed() {
        let v = json!({ "choices": [ { "index": 0, "message": { "content": "a" } } ] });
        assert!(extract_openai_choices(&v, 3).is_err());
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(classify_status(401, String::new()), CompletionError::Auth(_)));
        assert!(matches!(classify_status(429, String::new()), CompletionError::RateLimit(_)));
        assert!(matches!(
            classify_status(500, "boom".into()),
            CompletionError::Service { status: 500, .. }
        ));
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = LlmClient::new(ProviderConfig::default()).err();
        assert!(matches!(err, Some(CompletionError::NotConfigured(_))));
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!(Provider::parse("OpenAI"), Some(Provider::OpenAI));
        assert_eq!(Provider::parse("anthropic"), Some(Provider::Anthropic));
        assert_eq!(Provider::parse("ollama"), None);
    }
}
