use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    OpenAi,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Some(ProviderKind::Ollama),
            "openai" | "open_ai" | "openai-compatible" => Some(ProviderKind::OpenAi),
            _ => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "qwen3:8b",
            ProviderKind::OpenAi => "gpt-4o-mini",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    /// Only honored by providers that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub max_output_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            temperature: 0.7,
            top_p: 0.95,
            top_k: None,
            max_output_tokens: 8192,
        }
    }
}

/// Everything needed to reach one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub params: GenerationParams,
    /// Deadline for a single provider call.
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            kind: ProviderKind::Ollama,
            api_key: None,
            base_url: None,
            model: ProviderKind::Ollama.default_model().to_string(),
            params: GenerationParams::default(),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Per-job `providerConfig`; set fields replace the server defaults for that job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOverrides {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderSettings {
    pub fn merged(&self, overrides: &ProviderOverrides) -> ProviderSettings {
        let mut out = self.clone();
        if let Some(kind) = overrides.provider.as_deref().and_then(ProviderKind::parse) {
            if kind != out.kind {
                // a different vendor never inherits the default vendor's model or endpoint
                out.kind = kind;
                out.model = kind.default_model().to_string();
                out.base_url = None;
                out.api_key = None;
            }
        }
        if let Some(key) = &overrides.api_key {
            out.api_key = Some(key.clone());
        }
        if let Some(url) = &overrides.base_url {
            out.base_url = Some(url.clone());
        }
        if let Some(model) = &overrides.model {
            out.model = model.clone();
        }
        if let Some(t) = overrides.temperature {
            out.params.temperature = t;
        }
        if let Some(p) = overrides.top_p {
            out.params.top_p = p;
        }
        if overrides.top_k.is_some() {
            out.params.top_k = overrides.top_k;
        }
        if let Some(n) = overrides.max_output_tokens {
            out.params.max_output_tokens = n;
        }
        if let Some(secs) = overrides.timeout_secs {
            out.timeout = Duration::from_secs(secs);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub provider: ProviderSettings,
    pub eviction_grace: Duration,
    pub eviction_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = get("LLM_PROVIDER")
            .as_deref()
            .and_then(ProviderKind::parse)
            .unwrap_or(ProviderKind::Ollama);
        let base_url = get("LLM_BASE_URL").or_else(|| match kind {
            ProviderKind::Ollama => get("OLLAMA_URL"),
            ProviderKind::OpenAi => None,
        });
        let defaults = GenerationParams::default();

        let provider = ProviderSettings {
            kind,
            api_key: get("LLM_API_KEY").filter(|k| !k.is_empty()),
            base_url,
            model: get("LLM_MODEL").unwrap_or_else(|| kind.default_model().to_string()),
            params: GenerationParams {
                temperature: parse_var(&get, "LLM_TEMPERATURE").unwrap_or(defaults.temperature),
                top_p: parse_var(&get, "LLM_TOP_P").unwrap_or(defaults.top_p),
                top_k: parse_var(&get, "LLM_TOP_K"),
                max_output_tokens: parse_var(&get, "LLM_MAX_OUTPUT_TOKENS")
                    .unwrap_or(defaults.max_output_tokens),
            },
            timeout: Duration::from_secs(parse_var(&get, "LLM_TIMEOUT_SECS").unwrap_or(180)),
        };

        Config {
            port: parse_var(&get, "PORT").unwrap_or(3001),
            database_path: get("DATABASE_PATH").unwrap_or_else(|| "lessonforge.db".to_string()),
            provider,
            eviction_grace: Duration::from_secs(parse_var(&get, "TASK_EVICTION_GRACE_SECS").unwrap_or(30)),
            eviction_interval: Duration::from_secs(
                parse_var(&get, "TASK_EVICTION_INTERVAL_SECS").unwrap_or(10),
            ),
        }
    }
}

fn parse_var<T, F>(get: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    get(key).and_then(|v| v.trim().parse().ok())
}
