use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;

use super::{
    LlmProvider, ProviderError, anthropic::AnthropicProvider, ollama::OllamaProvider,
    openai::OpenAiProvider,
};

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(cfg: &Config) -> Result<Self, ProviderError> {
        let mut map: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();

        let openai_key = match &cfg.openai {
            Some(oc) => oc.effective_api_key(),
            None => std::env::var("OPENAI_API_KEY").ok(),
        };
        if let Some(key) = openai_key {
            let oc = cfg.openai.as_ref();
            let base = oc
                .and_then(|c| c.base_url.clone())
                .unwrap_or_else(|| "https://api.openai.com/v1".into());
            let model = oc
                .and_then(|c| c.default_model.clone())
                .unwrap_or_else(|| "gpt-4o-mini".into());
            map.insert("openai".into(), Arc::new(OpenAiProvider::new(base, key, model)?));
        }

        let anthropic_key = match &cfg.anthropic {
            Some(ac) => ac.effective_api_key(),
            None => std::env::var("ANTHROPIC_API_KEY").ok(),
        };
        if let Some(key) = anthropic_key {
            let ac = cfg.anthropic.as_ref();
            let base = ac
                .and_then(|c| c.base_url.clone())
                .unwrap_or_else(|| "https://api.anthropic.com".into());
            let version = ac
                .map(|c| c.effective_version())
                .unwrap_or_else(|| "2023-06-01".into());
            let model = ac
                .and_then(|c| c.default_model.clone())
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".into());
            let p = AnthropicProvider::new(base, key, version, model)?;
            map.insert("anthropic".into(), Arc::new(p));
        }

        // Local default so the CLI works without any keys
        let (base, model) = match &cfg.ollama {
            Some(oc) => (
                oc.effective_base_url(),
                oc.default_model.clone().unwrap_or_else(|| "llama3.1".into()),
            ),
            None => ("http://localhost:11434".into(), "llama3.1".into()),
        };
        map.insert("ollama".into(), Arc::new(OllamaProvider::new(base, model)?));

        Ok(Self { providers: map })
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.providers
            .get(key)
            .cloned()
            .ok_or_else(|| ProviderError::Config(format!("unknown provider: {key}")))
    }

    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OllamaConfig;

    #[test]
    fn ollama_is_always_registered() {
        let cfg = Config {
            ollama: Some(OllamaConfig {
                base_url: Some("http://127.0.0.1:1".into()),
                default_model: Some("qwen2".into()),
            }),
            ..Default::default()
        };
        let reg = ProviderRegistry::from_config(&cfg).unwrap();
        assert!(reg.list().contains(&"ollama".to_string()));
        assert_eq!(reg.get("ollama").unwrap().default_model(), "qwen2");
        assert!(reg.get("nope").is_err());
    }
}
