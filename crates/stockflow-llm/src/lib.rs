pub mod providers;
pub mod retry;
pub mod streaming;

use stockflow_core::config::{AppConfig, ModelConfig};
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::LlmClient;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
///
/// Only OpenAI-compatible endpoints are supported; point `base_url` at
/// Ollama, vLLM, Groq or OpenRouter to use them.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "openai" | "openai-compatible" | "ollama" | "groq" | "openrouter" | "vllm" => {
            Ok(Box::new(OpenAiClient::new()))
        }
        other => Err(StockflowError::UnsupportedProvider(other.to_string())),
    }
}

/// Build the client for the whole config: the primary model wrapped in
/// retry/fallback handling when either is configured.
pub fn client_from_config(config: &AppConfig) -> Result<Box<dyn LlmClient>> {
    let primary = create_client(&config.model)?;
    if config.model.retry.is_none() && config.fallback_models.is_empty() {
        return Ok(primary);
    }

    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| Ok((fb.clone(), create_client(fb)?)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Box::new(RetryingClient::new(
        primary,
        fallbacks,
        config.model.retry.clone().unwrap_or_default(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        let mut config = ModelConfig::new("claude-x");
        config.provider = "anthropic".into();
        match create_client(&config) {
            Err(StockflowError::UnsupportedProvider(p)) => assert_eq!(p, "anthropic"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected UnsupportedProvider"),
        }
    }

    #[test]
    fn openai_provider_is_accepted() {
        assert!(create_client(&ModelConfig::new("gpt-4o")).is_ok());
    }
}
