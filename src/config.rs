use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::reduce::{DEFAULT_KEEP_RECENT, DEFAULT_TRUNCATE_TARGET};
use crate::window::WindowConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub openai: Option<OpenAiConfig>,
    pub anthropic: Option<AnthropicConfig>,
    pub ollama: Option<OllamaConfig>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub view: ViewConfig,
    /// Model id -> documented hard context size, merged over the built-in table.
    #[serde(default)]
    pub models: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatConfig {
    pub default_provider: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Quiet period before a usage recomputation runs.
    pub debounce_ms: u64,
    /// Fraction of the soft limit that truncation aims for.
    pub truncate_target: f64,
    /// Messages kept verbatim by the optimizer.
    pub keep_recent: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            truncate_target: DEFAULT_TRUNCATE_TARGET,
            keep_recent: DEFAULT_KEEP_RECENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub threshold: usize,
    pub overscan: usize,
    pub estimated_height: u32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        let w = WindowConfig::default();
        Self {
            threshold: w.threshold,
            overscan: w.overscan,
            estimated_height: w.estimated_height,
        }
    }
}

impl ViewConfig {
    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            threshold: self.threshold,
            overscan: self.overscan,
            estimated_height: self.estimated_height,
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Some(p) = path {
            let text = fs::read_to_string(p).with_context(|| format!("reading config at {p}"))?;
            return parse(&text).with_context(|| "parsing config");
        }
        let default = Self::default_path()?;
        if default.exists() {
            let text = fs::read_to_string(&default)
                .with_context(|| format!("reading config at {}", default.display()))?;
            parse(&text).with_context(|| "parsing config")
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| anyhow!("cannot resolve config dir"))?;
        Ok(base.join("rusty-chat").join("config.toml"))
    }

    pub fn write_example_if_absent() -> Result<PathBuf> {
        let path = Self::default_path()?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, EXAMPLE)?;
        }
        Ok(path)
    }
}

const EXAMPLE: &str = r#"# rusty-chat config (TOML)

[openai]
# api_key can be omitted to use env var OPENAI_API_KEY
api_key = ""
base_url = "https://api.openai.com/v1"
default_model = "gpt-4o-mini"

[anthropic]
# api_key can be omitted to use env var ANTHROPIC_API_KEY
api_key = ""
base_url = "https://api.anthropic.com"
version = "2023-06-01"
default_model = "claude-3-5-sonnet-latest"

[ollama]
base_url = "http://localhost:11434"
default_model = "llama3.1"

[chat]
default_provider = "openai"
system_prompt = "You are a helpful assistant."
temperature = 0.7

[budget]
debounce_ms = 300
truncate_target = 0.7
keep_recent = 6

[view]
threshold = 50
overscan = 5
estimated_height = 3

# Documented hard context sizes; the working budget is 80% of these.
[models]
# "my-local-model" = 32768
"#;

fn parse(text: &str) -> Result<Config> {
    toml::from_str(text).map_err(|e| anyhow!(e))
}

impl OpenAiConfig {
    pub fn effective_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

impl AnthropicConfig {
    pub fn effective_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
    }
    pub fn effective_version(&self) -> String {
        self.version.clone().unwrap_or_else(|| "2023-06-01".into())
    }
}

impl OllamaConfig {
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses() {
        let cfg = parse(EXAMPLE).unwrap();
        assert_eq!(cfg.chat.default_provider.as_deref(), Some("openai"));
        assert_eq!(cfg.budget.keep_recent, 6);
        assert_eq!(cfg.view.overscan, 5);
        assert!(cfg.models.is_empty());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = parse("[models]\n\"tiny\" = 2048\n").unwrap();
        assert_eq!(cfg.budget.debounce_ms, 300);
        assert!((cfg.budget.truncate_target - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.view.threshold, 50);
        assert_eq!(cfg.models.get("tiny"), Some(&2048));
    }
}
