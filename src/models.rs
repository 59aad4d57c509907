//! Model profiles: documented context sizes and the soft budget derived from them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Hard context size assumed for models missing from the table.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;

const BUILTIN: &[(&str, u32)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3-mini", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("claude-3-opus", 200_000),
    ("llama3.1", 128_000),
    ("llama3", 8_192),
    ("mistral", 32_768),
    ("qwen2", 32_768),
    ("deepseek-chat", 64_000),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: String,
    /// Local budget ceiling: 80% of the provider's hard context size.
    pub soft_limit: u32,
}

impl ModelProfile {
    pub fn from_context_window(id: impl Into<String>, context_window: u32) -> Self {
        let soft_limit = (u64::from(context_window) * 4 / 5) as u32;
        Self { id: id.into(), soft_limit }
    }

    pub fn with_soft_limit(id: impl Into<String>, soft_limit: u32) -> Self {
        Self { id: id.into(), soft_limit }
    }
}

#[derive(Debug, Clone)]
pub struct ModelTable {
    windows: HashMap<String, u32>,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self {
            windows: BUILTIN.iter().map(|(id, w)| (id.to_string(), *w)).collect(),
        }
    }
}

impl ModelTable {
    /// Built-in table with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<String, u32>) -> Self {
        let mut table = Self::default();
        for (id, window) in overrides {
            table.windows.insert(id.clone(), *window);
        }
        table
    }

    /// Exact id, then the longest known id prefixing `id`, then the default profile.
    pub fn profile(&self, id: &str) -> ModelProfile {
        if let Some(w) = self.windows.get(id) {
            return ModelProfile::from_context_window(id, *w);
        }
        let best = self
            .windows
            .iter()
            .filter(|(known, _)| id.starts_with(known.as_str()))
            .max_by_key(|(known, _)| known.len());
        match best {
            Some((_, w)) => ModelProfile::from_context_window(id, *w),
            None => {
                tracing::debug!(model = id, "unknown model, using default profile");
                ModelProfile::from_context_window(id, DEFAULT_CONTEXT_WINDOW)
            }
        }
    }
}
