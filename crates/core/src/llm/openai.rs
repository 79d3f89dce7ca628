use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use tracing::debug;

use super::{
    GOOGLE_OPENAI_BASE, LlmError, LlmProvider, MAX_TOKENS, REQUEST_TIMEOUT, ResponseSchema,
    TEMPERATURE,
};

/// An `LlmProvider` for any OpenAI-compatible chat completions API.
///
/// OpenAI itself, Google's OpenAI-compatible Gemini endpoint, and a local
/// Ollama server all speak the same protocol and differ only in base URL and
/// credentials.
pub struct OpenAICompatibleProvider {
    client: Client<OpenAIConfig>,
    model: String,
    name: &'static str,
    available: bool,
}

impl OpenAICompatibleProvider {
    /// Creates a provider against an explicit endpoint.
    ///
    /// # Arguments
    ///
    /// * `name` - Provider label used in logs.
    /// * `api_base` - Base URL of the chat completions API.
    /// * `api_key` - Credential; `None` marks the provider unavailable unless
    ///   `keyless` is set.
    /// * `model` - Model identifier (e.g., "gpt-4o-mini").
    pub fn new(
        name: &'static str,
        api_base: &str,
        api_key: Option<String>,
        keyless: bool,
        model: &str,
    ) -> Self {
        let available = keyless || api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        let config = OpenAIConfig::new()
            .with_api_base(api_base)
            .with_api_key(api_key.unwrap_or_default());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client: Client::with_config(config).with_http_client(http),
            model: model.to_string(),
            name,
            available,
        }
    }

    pub fn openai(api_key: Option<String>, model: &str) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key, false, model)
    }

    pub fn google(api_key: Option<String>, model: &str) -> Self {
        Self::new("google", GOOGLE_OPENAI_BASE, api_key, false, model)
    }

    /// Ollama ignores the key but the client still sends one.
    pub fn ollama(base_url: String, model: &str) -> Self {
        Self::new("ollama", &base_url, Some("ollama".to_string()), true, model)
    }

    fn request(
        &self,
        prompt: &str,
        format: Option<ResponseFormat>,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(vec![message.into()])
            .temperature(TEMPERATURE)
            .max_completion_tokens(MAX_TOKENS);
        if let Some(format) = format {
            args.response_format(format);
        }
        args.build().map_err(|e| LlmError::Request(e.to_string()))
    }

    async fn complete(&self, request: CreateChatCompletionRequest) -> Result<String, LlmError> {
        if !self.available {
            return Err(LlmError::Unavailable(self.name));
        }
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Response("no content in completion".to_string()))?;
        debug!(provider = self.name, chars = content.len(), "completion received");
        Ok(content)
    }
}

#[async_trait]
impl LlmProvider for OpenAICompatibleProvider {
    async fn call(&self, prompt: &str) -> Result<String, LlmError> {
        let request = self.request(prompt, None)?;
        self.complete(request).await
    }

    async fn call_with_schema(
        &self,
        prompt: &str,
        schema: &ResponseSchema,
    ) -> Result<String, LlmError> {
        let format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: "structured_response".to_string(),
                schema: Some(schema.clone()),
                strict: None,
            },
        };
        let request = self.request(prompt, Some(format))?;
        self.complete(request).await
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
