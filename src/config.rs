use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::judge::prompt::DEFAULT_PROMPT_TEMPLATE;
use crate::model::QuerySet;

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_JUDGE_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_JUDGE_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_JUDGE_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub name: String,
    pub backend: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl SystemConfig {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, EngineError> {
        self.option_str(key).ok_or_else(|| {
            EngineError::configuration(format!(
                "system '{}' ({}) requires option '{key}'",
                self.name, self.backend
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeProviderConfig {
    #[serde(default = "default_judge_base_url")]
    pub base_url: String,
    #[serde(default = "default_judge_model")]
    pub model: String,
    #[serde(default = "default_judge_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_judge_base_url() -> String {
    DEFAULT_JUDGE_BASE_URL.to_string()
}

fn default_judge_model() -> String {
    DEFAULT_JUDGE_MODEL.to_string()
}

fn default_judge_api_key_env() -> String {
    DEFAULT_JUDGE_API_KEY_ENV.to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for JudgeProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_judge_base_url(),
            model: default_judge_model(),
            api_key_env: default_judge_api_key_env(),
            temperature: 0.0,
            max_tokens: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_evaluator_name")]
    pub name: String,
    #[serde(default)]
    pub provider: JudgeProviderConfig,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_chunks_per_system")]
    pub max_chunks_per_system: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_evaluator_name() -> String {
    "default-judge".to_string()
}

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_max_chunks_per_system() -> usize {
    5
}

fn default_max_chunk_chars() -> usize {
    1_200
}

fn default_max_concurrency() -> usize {
    1
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            name: default_evaluator_name(),
            provider: JudgeProviderConfig::default(),
            prompt_template: default_prompt_template(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_chunks_per_system: default_max_chunks_per_system(),
            max_chunk_chars: default_max_chunk_chars(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl EvaluatorConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.prompt_template.contains("{query}") {
            return Err(EngineError::configuration(
                "evaluator prompt_template must contain a {query} placeholder",
            ));
        }
        if !self.prompt_template.contains("{systems}") {
            return Err(EngineError::configuration(
                "evaluator prompt_template must contain a {systems} placeholder",
            ));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::configuration(
                "evaluator max_attempts must be at least 1",
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::configuration(
                "evaluator max_concurrency must be at least 1",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(EngineError::configuration(
                "evaluator max_delay_ms must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Source of environment-style settings, injectable so resolution stays testable.
pub trait Environment {
    fn get(&self, name: &str) -> Option<String>;
}

pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

/// Explicit overrides win over the environment; blank values count as absent.
pub fn resolve_setting(
    name: &str,
    overrides: &BTreeMap<String, String>,
    environment: &dyn Environment,
) -> Option<String> {
    let non_blank = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };

    overrides
        .get(name)
        .cloned()
        .and_then(non_blank)
        .or_else(|| environment.get(name).and_then(non_blank))
}

/// Credential lookup handed to backend and judge factories.
pub struct Credentials<'a> {
    overrides: &'a BTreeMap<String, String>,
    environment: &'a dyn Environment,
}

impl<'a> Credentials<'a> {
    pub fn new(overrides: &'a BTreeMap<String, String>, environment: &'a dyn Environment) -> Self {
        Self {
            overrides,
            environment,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        resolve_setting(name, self.overrides, self.environment)
    }
}

pub fn parse_credential_overrides(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("credential override must look like NAME=VALUE: {pair}"))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("credential override has an empty name: {pair}");
        }
        overrides.insert(name.to_string(), value.to_string());
    }
    Ok(overrides)
}

fn load_json_file<T: DeserializeOwned>(path: &Path, label: &str) -> Result<T> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read {label}: {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {label}: {}", path.display()))
}

pub fn load_system_config(path: &Path) -> Result<SystemConfig> {
    let config: SystemConfig = load_json_file(path, "system config")?;
    if config.name.trim().is_empty() {
        anyhow::bail!("system config has an empty name: {}", path.display());
    }
    Ok(config)
}

pub fn load_query_set(path: &Path) -> Result<QuerySet> {
    load_json_file(path, "query set")
}

pub fn load_evaluator_config(path: Option<&Path>) -> Result<EvaluatorConfig> {
    let config = match path {
        Some(path) => load_json_file(path, "evaluator config")?,
        None => EvaluatorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
