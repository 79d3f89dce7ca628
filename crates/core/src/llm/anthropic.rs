use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{LlmError, LlmProvider, MAX_TOKENS, REQUEST_TIMEOUT, ResponseSchema, TEMPERATURE};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// An `LlmProvider` for Anthropic's messages API.
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, model: &str) -> Result<Self, LlmError> {
        Self::with_endpoint(api_key, model, MESSAGES_URL)
    }

    pub fn with_endpoint(
        api_key: Option<String>,
        model: &str,
        endpoint: &str,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    async fn send(&self, prompt: String) -> Result<String, LlmError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::Unavailable("anthropic"));
        };
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!("status {status}: {detail}")));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;
        parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| LlmError::Response("no text block in response".to_string()))
    }
}

/// The messages API has no response-format switch, so the schema travels in
/// the prompt.
fn schema_prompt(prompt: &str, schema: &ResponseSchema) -> String {
    format!(
        "{prompt}\n\nRespond ONLY with valid JSON matching this JSON schema, with no surrounding text:\n{schema}"
    )
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn call(&self, prompt: &str) -> Result<String, LlmError> {
        self.send(prompt.to_string()).await
    }

    async fn call_with_schema(
        &self,
        prompt: &str,
        schema: &ResponseSchema,
    ) -> Result<String, LlmError> {
        self.send(schema_prompt(prompt, schema)).await
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_prompt_embeds_schema() {
        let schema = json!({"type": "object", "required": ["summary"]});
        let prompt = schema_prompt("Summarize.", &schema);
        assert!(prompt.starts_with("Summarize."));
        assert!(prompt.contains("\"required\":[\"summary\"]"));
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let provider = AnthropicProvider::new(None, "claude-3-5-haiku-latest").unwrap();
        assert!(!provider.is_available());
        assert_eq!(
            provider.call("hi").await.unwrap_err(),
            LlmError::Unavailable("anthropic")
        );
    }
}
