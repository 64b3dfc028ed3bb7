//! Text-model capability and its edgequake-llm adapter.
//!
//! The generator only needs "prompt + model id + parameters → text". Keeping
//! that behind [`TextModel`] lets tests script primary/fallback behaviour
//! without a network, and lets callers plug in any provider edgequake-llm
//! supports.

use crate::config::GenerationParams;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// A failed text-model call, as reported by the backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

/// One chat-style completion.
#[derive(Debug, Clone, Copy)]
pub struct TextPrompt<'a> {
    pub system: &'a str,
    pub user: &'a str,
}

/// Produces text for a prompt with a given model.
///
/// Implementations must be safe to share between concurrent jobs.
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: TextPrompt<'_>,
        params: &GenerationParams,
    ) -> Result<String, BackendError>;
}

/// [`TextModel`] backed by edgequake-llm providers.
///
/// edgequake-llm binds a model at provider construction, so one provider is
/// created per model id on first use and reused afterwards.
pub struct LlmTextModel {
    provider_name: String,
    providers: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
}

impl std::fmt::Debug for LlmTextModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let models: Vec<String> = self
            .providers
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("LlmTextModel")
            .field("provider_name", &self.provider_name)
            .field("models", &models)
            .finish()
    }
}

impl LlmTextModel {
    /// Providers are created lazily through `ProviderFactory`, which reads
    /// the API key for `provider_name` from the environment.
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Use a pre-built provider for `model` instead of the factory.
    pub fn with_provider(self, model: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(model.into(), provider);
        self
    }

    fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, BackendError> {
        let mut providers = self
            .providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(p) = providers.get(model) {
            return Ok(Arc::clone(p));
        }
        let provider = ProviderFactory::create_llm_provider(&self.provider_name, model)
            .map_err(|e| {
                BackendError(format!(
                    "provider '{}' not configured for model '{}': {}",
                    self.provider_name, model, e
                ))
            })?;
        providers.insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }
}

#[async_trait]
impl TextModel for LlmTextModel {
    async fn complete(
        &self,
        model: &str,
        prompt: TextPrompt<'_>,
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        let provider = self.provider_for(model)?;
        let messages = vec![ChatMessage::system(prompt.system), ChatMessage::user(prompt.user)];
        let options = build_options(params);

        let start = Instant::now();
        let response = provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| BackendError(e.to_string()))?;
        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            model,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// Build `CompletionOptions` from generation parameters.
fn build_options(params: &GenerationParams) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(params.temperature),
        max_tokens: Some(params.max_tokens),
        ..Default::default()
    }
}
