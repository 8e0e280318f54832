use super::{CompletionRequest, TextGenerator};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(settings: &ProviderSettings) -> Self {
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        OllamaClient {
            client: Client::new(),
            base_url,
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: &self.model,
            prompt: &req.prompt,
            system: Some(req.system.as_str()).filter(|s| !s.is_empty()),
            stream: false,
            options: GenerateOptions {
                temperature: req.params.temperature,
                top_p: req.params.top_p,
                top_k: req.params.top_k,
                num_predict: req.params.max_output_tokens,
            },
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let gen_response: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("ollama generate: {}", e)))?;

        Ok(gen_response.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationParams;

    #[test]
    fn test_options_serialization() {
        let request = GenerateRequest {
            model: "qwen3:8b",
            prompt: "hi",
            system: None,
            stream: false,
            options: GenerateOptions {
                temperature: 0.5,
                top_p: 0.9,
                top_k: None,
                num_predict: 512,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["stream"], false);
        assert_eq!(value["options"]["num_predict"], 512);
        assert!(value.get("system").is_none());
        assert!(value["options"].get("top_k").is_none());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = OllamaClient::new(&ProviderSettings {
            base_url: Some("http://gpu-box:11434/".into()),
            ..ProviderSettings::default()
        });
        assert_eq!(client.base_url, "http://gpu-box:11434");
    }

    #[tokio::test]
    async fn test_network_error() {
        // Port 9999 should not have Ollama running
        let client = OllamaClient::new(&ProviderSettings {
            base_url: Some("http://localhost:9999".into()),
            ..ProviderSettings::default()
        });
        let req = CompletionRequest {
            system: String::new(),
            prompt: "test".into(),
            params: GenerationParams::default(),
        };
        let result = client.complete(&req).await;
        assert!(matches!(result, Err(ProviderError::Network(_))));
    }
}
