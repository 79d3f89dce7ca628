//! Prompt construction and reply extraction for conversational agents.

use serde::Deserialize;

use crate::context::NO_CONTEXT;
use crate::llm::strip_code_fence;
use crate::models::AgentConfig;

const REPLY_FORMAT: &str = r#"You must respond ONLY with valid JSON in the following format:
{
  "assistant_reply": "<Your actual response to speak to the user>",
  "metadata": {
    "topic": "<Optional: topic of the response>",
    "confidence": <Optional: confidence score as a float>
  }
}"#;

#[derive(Deserialize)]
struct StructuredReply {
    assistant_reply: String,
}

/// Builds prompts for one agent and turns completions into speakable text.
#[derive(Debug, Clone)]
pub struct Responder {
    agent_name: String,
    custom_prompt: Option<String>,
}

impl Responder {
    pub fn new(agent_name: impl Into<String>, custom_prompt: Option<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            custom_prompt: custom_prompt.filter(|p| !p.trim().is_empty()),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.name.clone(), config.custom_prompt.clone())
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Fills the custom template (`{agent_name}`, `{speaker}`, `{text}`,
    /// `{context}`) or falls back to the built-in prompt.
    pub fn build_prompt(&self, speaker: &str, text: &str, context: &str) -> String {
        let context = if context.trim().is_empty() {
            NO_CONTEXT
        } else {
            context
        };

        if let Some(template) = &self.custom_prompt {
            return template
                .replace("{agent_name}", &self.agent_name)
                .replace("{speaker}", speaker)
                .replace("{text}", text)
                .replace("{context}", context);
        }

        if context == NO_CONTEXT {
            format!(
                "You are a helpful AI assistant named {name} participating in a meeting.\n\n\
                 A participant named {speaker} just said: \"{text}\"\n\n\
                 Please respond naturally and helpfully. Keep your response concise and conversational.\n\n\
                 {REPLY_FORMAT}",
                name = self.agent_name,
            )
        } else {
            format!(
                "You are a helpful AI assistant named {name} participating in a meeting.\n\n\
                 Conversation history:\n{context}\n\n\
                 Current: A participant named {speaker} just said: \"{text}\"\n\n\
                 Please respond naturally and helpfully, considering the conversation history. \
                 Keep your response concise and conversational.\n\n\
                 {REPLY_FORMAT}",
                name = self.agent_name,
            )
        }
    }

    /// Canned reply used when no model is reachable.
    pub fn fallback_reply(&self, speaker: &str, text: &str) -> String {
        let lower = text.to_lowercase();
        let has_word = |w: &str| lower.split(|c: char| !c.is_alphanumeric()).any(|t| t == w);

        if has_word("hello") || has_word("hi") {
            format!("Hello {speaker}! I'm {}, nice to meet you!", self.agent_name)
        } else if lower.contains("how are you") {
            "I'm doing well, thank you for asking! How can I help you?".to_string()
        } else if lower.contains("thank") {
            "You're very welcome!".to_string()
        } else if has_word("bye") || has_word("goodbye") {
            "Goodbye! Have a great day!".to_string()
        } else if has_word("help") {
            "I'm here to help! What can I assist you with?".to_string()
        } else if lower.contains(&self.agent_name.to_lowercase()) {
            format!("Yes, I'm {}. How can I help you?", self.agent_name)
        } else {
            format!("I heard you, {speaker}. Could you tell me a bit more?")
        }
    }
}

/// Extracts `assistant_reply` from a JSON completion, falling back to the raw
/// text when the model ignored the format.
pub fn parse_reply(raw: &str) -> String {
    let body = strip_code_fence(raw);
    match serde_json::from_str::<StructuredReply>(body) {
        Ok(reply) => reply.assistant_reply.trim().to_string(),
        Err(_) => raw.trim().to_string(),
    }
}
