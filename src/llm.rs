//! Language-model backends used by the classifier

use async_trait::async_trait;

use crate::config::ClassificationConfig;
use crate::error::{Result, ScanError};

/// Single-prompt text completion
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Completion text, or `None` when the model returned nothing
    async fn complete(&self, prompt: &str) -> Result<Option<String>>;
}

/// Backend that never answers, so every message takes the fallback class
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn complete(&self, _prompt: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(feature = "ml")]
pub use openai::OpenAiClient;

#[cfg(feature = "ml")]
mod openai {
    use super::*;
    use async_openai::{
        config::OpenAIConfig,
        types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs},
        Client,
    };
    use tracing::debug;

    pub struct OpenAiClient {
        client: Client<OpenAIConfig>,
        model: String,
    }

    impl OpenAiClient {
        pub fn new(api_key: String, model: String) -> Self {
            let config = OpenAIConfig::new().with_api_key(api_key);
            Self {
                client: Client::with_config(config),
                model,
            }
        }
    }

    fn classification_error(e: impl std::fmt::Display) -> ScanError {
        ScanError::ClassificationError(e.to_string())
    }

    #[async_trait]
    impl LlmClient for OpenAiClient {
        async fn complete(&self, prompt: &str) -> Result<Option<String>> {
            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(classification_error)?;

            let request = CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .temperature(0.0)
                .messages([message.into()])
                .build()
                .map_err(classification_error)?;

            debug!("Sending classification prompt to {}", self.model);
            let response = self
                .client
                .chat()
                .create(request)
                .await
                .map_err(classification_error)?;

            Ok(response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()))
        }
    }
}

/// Build the backend named by `classification.provider`
pub fn build_llm(config: &ClassificationConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlm)),
        "openai" => build_openai(config),
        other => Err(ScanError::ConfigError(format!(
            "Unsupported classification provider: '{}'",
            other
        ))),
    }
}

#[cfg(feature = "ml")]
fn build_openai(config: &ClassificationConfig) -> Result<Box<dyn LlmClient>> {
    let api_key = std::env::var(&config.api_key_env).map_err(|_| {
        ScanError::ConfigError(format!("{} is not set", config.api_key_env))
    })?;
    Ok(Box::new(OpenAiClient::new(api_key, config.model.clone())))
}

#[cfg(not(feature = "ml"))]
fn build_openai(_config: &ClassificationConfig) -> Result<Box<dyn LlmClient>> {
    Err(ScanError::ConfigError(
        "provider 'openai' requires the `ml` feature; rebuild with --features ml \
         or set classification.provider = \"disabled\""
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_llm_returns_nothing() {
        let answer = DisabledLlm.complete("anything").await.unwrap();
        assert!(answer.is_none());
    }

    #[test]
    fn test_build_llm_disabled() {
        let config = ClassificationConfig {
            provider: "disabled".to_string(),
            ..Default::default()
        };
        assert!(build_llm(&config).is_ok());
    }

    #[cfg(not(feature = "ml"))]
    #[test]
    fn test_openai_without_ml_feature_is_config_error() {
        let result = build_llm(&ClassificationConfig::default());
        match result {
            Err(ScanError::ConfigError(message)) => assert!(message.contains("`ml` feature")),
            Err(other) => panic!("expected config error, got {}", other),
            Ok(_) => panic!("openai provider must not silently degrade"),
        }
    }

    #[test]
    fn test_build_llm_rejects_unknown_provider() {
        let config = ClassificationConfig {
            provider: "gemini".to_string(),
            ..Default::default()
        };
        let result = build_llm(&config);
        assert!(matches!(result, Err(ScanError::ConfigError(_))));
    }
}
