//! Extraction client: one stateless LLM call that turns chunk text into JSON.
//!
//! The [`ExtractionClient`] trait is the seam between the retry state machine
//! and the network. [`LlmExtractor`] implements it over any
//! `edgequake_llm::LLMProvider`; tests substitute scripted clients.
//!
//! Timeouts are not applied here: the orchestrator wraps every call so that
//! extraction and repair share one timeout policy.

use crate::config::PipelineConfig;
use crate::error::{AttemptError, Script2JsonError};
use crate::pipeline::postprocess::parse_json_object;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Default model when only a provider name is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Converts chunk text to structured JSON.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Run one extraction call.
    ///
    /// `text` is appended to `user_prompt` after a blank line; an empty `text`
    /// sends `user_prompt` alone (used by repair calls).
    async fn extract(&self, text: &str, system_prompt: &str, user_prompt: &str) -> Result<Value, AttemptError>;
}

/// [`ExtractionClient`] backed by an edgequake-llm provider.
pub struct LlmExtractor {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }

    /// Resolve the provider from `config` and wrap it.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, Script2JsonError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }
}

#[async_trait]
impl ExtractionClient for LlmExtractor {
    async fn extract(&self, text: &str, system_prompt: &str, user_prompt: &str) -> Result<Value, AttemptError> {
        let user = if text.is_empty() {
            user_prompt.to_string()
        } else {
            format!("{}\n\n{}", user_prompt, text)
        };
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(&user)];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "LLM answered: {} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );

        parse_json_object(&response.content).map_err(|detail| AttemptError::Malformed {
            detail,
            raw: response.content.clone(),
        })
    }
}

/// Sort a provider error into retryable and non-retryable.
///
/// Authentication and authorisation failures never succeed on retry.
pub fn classify_provider_error(message: &str) -> AttemptError {
    let lower = message.to_lowercase();
    let permanent = ["401", "403", "authentication", "unauthorized", "invalid api key", "invalid_api_key"]
        .iter()
        .any(|needle| lower.contains(needle));
    if permanent {
        AttemptError::Permanent {
            detail: message.to_string(),
        }
    } else {
        AttemptError::Transport {
            detail: message.to_string(),
        }
    }
}

fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key** present → OpenAI with the configured or default model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, Script2JsonError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Script2JsonError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Script2JsonError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Script2JsonError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&PipelineConfig::default());
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(2048));
    }

    #[test]
    fn auth_errors_are_permanent() {
        assert!(matches!(
            classify_provider_error("HTTP 401: Incorrect API key provided"),
            AttemptError::Permanent { .. }
        ));
        assert!(matches!(
            classify_provider_error("Authentication failed"),
            AttemptError::Permanent { .. }
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(matches!(
            classify_provider_error("HTTP 503 Service Unavailable"),
            AttemptError::Transport { .. }
        ));
        assert!(matches!(
            classify_provider_error("rate limit exceeded (429)"),
            AttemptError::Transport { .. }
        ));
    }
}
