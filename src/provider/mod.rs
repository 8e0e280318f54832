//! Generative text providers behind one "complete text" capability.

pub mod ollama;
pub mod openai;

use crate::config::{GenerationParams, ProviderKind, ProviderSettings};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub params: GenerationParams,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Raw model output. No parsing happens here.
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// Turns per-job settings into a ready client. Swapped out in tests.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, settings: &ProviderSettings) -> Result<Arc<dyn TextGenerator>, ProviderError>;
}

#[derive(Debug, Default, Clone)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, settings: &ProviderSettings) -> Result<Arc<dyn TextGenerator>, ProviderError> {
        match settings.kind {
            ProviderKind::Ollama => Ok(Arc::new(ollama::OllamaClient::new(settings))),
            ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiClient::new(settings)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_picks_vendor() {
        let factory = HttpProviderFactory;
        let ollama = factory.build(&ProviderSettings::default()).unwrap();
        assert_eq!(ollama.name(), "ollama");

        let settings = ProviderSettings {
            kind: ProviderKind::OpenAi,
            api_key: Some("sk-test".into()),
            model: "gpt-4o-mini".into(),
            ..ProviderSettings::default()
        };
        assert_eq!(factory.build(&settings).unwrap().name(), "openai");
    }

    #[test]
    fn test_openai_without_key_is_rejected() {
        let settings = ProviderSettings {
            kind: ProviderKind::OpenAi,
            ..ProviderSettings::default()
        };
        let err = HttpProviderFactory.build(&settings).err().unwrap();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
