use super::{CompletionRequest, TextGenerator};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for any endpoint speaking the OpenAI chat completions protocol.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::NotConfigured("openai provider requires an API key".into()))?;
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(OpenAiClient {
            client: Client::new(),
            base_url,
            api_key,
            model: settings.model.clone(),
        })
    }

    fn build_request<'a>(&'a self, req: &'a CompletionRequest) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !req.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &req.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &req.prompt,
        });

        // top_k has no equivalent in this protocol
        ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: req.params.temperature,
            top_p: req.params.top_p,
            max_tokens: req.params.max_output_tokens,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(req))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("chat completion: {}", e)))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in chat completion".into()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationParams, ProviderKind};

    fn settings() -> ProviderSettings {
        ProviderSettings {
            kind: ProviderKind::OpenAi,
            api_key: Some("sk-test".into()),
            model: "gpt-4o-mini".into(),
            ..ProviderSettings::default()
        }
    }

    #[test]
    fn test_request_shape() {
        let client = OpenAiClient::new(&settings()).unwrap();
        let req = CompletionRequest {
            system: "be terse".into(),
            prompt: "make questions".into(),
            params: GenerationParams {
                top_k: Some(40),
                ..GenerationParams::default()
            },
        };
        let value = serde_json::to_value(client.build_request(&req)).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "make questions");
        assert_eq!(value["max_tokens"], 8192);
        assert!(value.get("top_k").is_none());
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        let client = OpenAiClient::new(&settings()).unwrap();
        let req = CompletionRequest {
            system: String::new(),
            prompt: "p".into(),
            params: GenerationParams::default(),
        };
        let value = serde_json::to_value(client.build_request(&req)).unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn test_default_base_url() {
        let client = OpenAiClient::new(&settings()).unwrap();
        assert_eq!(client.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_blank_key_rejected() {
        let mut s = settings();
        s.api_key = Some("  ".into());
        assert!(matches!(OpenAiClient::new(&s), Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn test_response_without_content() {
        let body: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#).unwrap();
        assert!(body.choices[0].message.content.is_none());
    }
}
