//! Language-Model Provider Boundary
//!
//! The core only ever asks a provider for text. Which vendor answers is a
//! configuration decision made by a [`ProviderFactory`]; nothing downstream
//! branches on the provider kind.

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAICompatibleProvider;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::LlmProviderKind;

/// Sampling temperature shared by every provider.
pub const TEMPERATURE: f32 = 0.3;
/// Upper bound on generated tokens for a single call.
pub const MAX_TOKENS: u32 = 2000;
/// Per-request timeout for model calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A JSON schema describing the expected structured response.
pub type ResponseSchema = Value;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM provider {0} is not available (no API key configured)")]
    Unavailable(&'static str),
    #[error("LLM request failed: {0}")]
    Request(String),
    #[error("LLM returned an unusable response: {0}")]
    Response(String),
}

/// Defines the contract for any language-model backend.
///
/// Implementations must be cheap to share across tasks; the supervisor hands
/// the same provider to every response task of an agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Sends a single free-form prompt and returns the raw completion text.
    async fn call(&self, prompt: &str) -> Result<String, LlmError>;

    /// Sends a prompt and constrains the answer to the given JSON schema.
    ///
    /// # Arguments
    ///
    /// * `prompt` - The full instruction text.
    /// * `schema` - A JSON schema object the response must satisfy.
    ///
    /// # Returns
    ///
    /// The raw completion text, which should parse as JSON matching `schema`.
    async fn call_with_schema(
        &self,
        prompt: &str,
        schema: &ResponseSchema,
    ) -> Result<String, LlmError>;

    /// Whether the provider has the credentials it needs to make calls.
    fn is_available(&self) -> bool;

    /// Short provider name used in logs.
    fn name(&self) -> &'static str;
}

/// Resolves the provider configured for an agent.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(
        &self,
        kind: LlmProviderKind,
        model: &str,
    ) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

/// Credentials and endpoints for the built-in providers.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub ollama_base_url: Option<String>,
}

pub const GOOGLE_OPENAI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434/v1";

/// Builds the concrete provider for each [`LlmProviderKind`].
#[derive(Debug, Clone, Default)]
pub struct CredentialedProviders {
    credentials: ProviderCredentials,
}

impl CredentialedProviders {
    pub fn new(credentials: ProviderCredentials) -> Self {
        Self { credentials }
    }
}

impl ProviderFactory for CredentialedProviders {
    fn provider_for(
        &self,
        kind: LlmProviderKind,
        model: &str,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let creds = &self.credentials;
        let provider: Arc<dyn LlmProvider> = match kind {
            LlmProviderKind::OpenAi => Arc::new(OpenAICompatibleProvider::openai(
                creds.openai_api_key.clone(),
                model,
            )),
            LlmProviderKind::Google => Arc::new(OpenAICompatibleProvider::google(
                creds.google_api_key.clone(),
                model,
            )),
            LlmProviderKind::Ollama => Arc::new(OpenAICompatibleProvider::ollama(
                creds
                    .ollama_base_url
                    .clone()
                    .unwrap_or_else(|| OLLAMA_DEFAULT_BASE.to_string()),
                model,
            )),
            LlmProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                creds.anthropic_api_key.clone(),
                model,
            )?),
        };
        Ok(provider)
    }
}

/// Strips a surrounding markdown code fence, if any.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
