//! config.rs
//!
//! User configuration at `<config dir>/testsmith/config.toml`. A missing
//! file means defaults; environment variables override the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::llm::{Provider, ProviderConfig};
use crate::sandbox::SandboxOptions;
use crate::state::{GenerationConfig, DEFAULT_MODEL};

pub const DEFAULT_IMAGE: &str = "testsmith-python:latest";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub generation: GenerationSection,
    pub sandbox: SandboxSection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAI,
            model: DEFAULT_MODEL.into(),
            api_key: String::new(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub temperature: f32,
    pub n_samples: u32,
    pub max_iter: u32,
    pub persist_failures: bool,
}

impl Default for GenerationSection {
    fn default() -> Self {
        let g = GenerationConfig::default();
        Self {
            temperature: g.temperature,
            n_samples: g.n_samples,
            max_iter: g.max_iter,
            persist_failures: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub binary: String,
    pub image: String,
    pub container_name: String,
    pub timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let opts = SandboxOptions::default();
        Self {
            binary: "docker".into(),
            image: DEFAULT_IMAGE.into(),
            container_name: opts.container_name,
            timeout_secs: opts.run_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Overrides the per-project location under the data dir.
    pub path: Option<PathBuf>,
}

pub fn config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("testsmith");
    dir.push("config.toml");
    dir
}

impl AppConfig {
    /// Reads the user config and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::load_from(&config_path())?;
        cfg.apply_env(|k| env::var(k).ok());
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(raw) => {
                debug!(path = %path.display(), "config loaded");
                Ok(toml::from_str(&raw)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        let key_var = match self.llm.provider {
            Provider::OpenAI => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        };
        if let Some(key) = get(key_var).filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = key;
        }
        if let Some(model) = get("TESTSMITH_MODEL").filter(|m| !m.trim().is_empty()) {
            self.llm.model = model;
        }
    }

    /// Stores provider, model and key, keeping every other setting.
    pub fn configure(
        path: &Path,
        provider: Provider,
        model: Option<String>,
        api_key: String,
    ) -> Result<Self, ConfigError> {
        let key = api_key.trim().to_string();
        if key.is_empty() {
            return Err(ConfigError::Invalid("API key must not be empty".into()));
        }

        let mut cfg = Self::load_from(path)?;
        cfg.llm.provider = provider;
        cfg.llm.api_key = key;
        if let Some(m) = model {
            cfg.llm.model = m;
        }
        cfg.save_to(path)?;
        Ok(cfg)
    }

    pub fn provider(&self) -> ProviderConfig {
        ProviderConfig {
            provider: self.llm.provider,
            api_key: self.llm.api_key.clone(),
            base_url: self.llm.base_url.clone(),
        }
    }

    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.generation.temperature,
            n_samples: self.generation.n_samples,
            max_iter: self.generation.max_iter,
            model_id: self.llm.model.clone(),
        }
    }

    pub fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            container_name: self.sandbox.container_name.clone(),
            run_timeout: Duration::from_secs(self.sandbox.timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.generation().max_iter, 5);
        assert_eq!(cfg.sandbox.image, DEFAULT_IMAGE);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[generation]\nn_samples = 3\n\n[llm]\nprovider = \"anthropic\"\n").unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.generation.n_samples, 3);
        assert_eq!(cfg.generation.max_iter, 5);
        assert_eq!(cfg.llm.provider, Provider::Anthropic);
        assert_eq!(cfg.llm.model, DEFAULT_MODEL);
    }

    #[test]
    fn env_overrides_file() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = "from-file".into();
        let env: HashMap<&str, &str> =
            [("OPENAI_API_KEY", "from-env"), ("TESTSMITH_MODEL", "gpt-4o")].into();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.llm.api_key, "from-env");
        assert_eq!(cfg.generation().model_id, "gpt-4o");
    }

    #[test]
    fn configure_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/config.toml");

        AppConfig::configure(&path, Provider::Anthropic, Some("claude-x".into()), " k ".into())
            .unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.api_key, "k");
        assert_eq!(cfg.llm.model, "claude-x");

        assert!(matches!(
            AppConfig::configure(&path, Provider::OpenAI, None, "  ".into()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn broken_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[generation\n").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
