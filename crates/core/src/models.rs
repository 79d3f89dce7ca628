//! Agent, transcript, and bookkeeping models shared by the supervisor and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::SupervisorError;

/// Lifecycle states of a supervised agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Created => "created",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        }
    }

    /// Whether the agent currently owns a live worker.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Starting | AgentStatus::Running)
    }

    /// Legal edges of the lifecycle graph. `stopped` and `error` may re-enter
    /// `starting`; every other edge moves forward.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopping)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Error)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopping)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    OpenAi,
    Anthropic,
    Google,
    Ollama,
}

impl LlmProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "openai",
            LlmProviderKind::Anthropic => "anthropic",
            LlmProviderKind::Google => "google",
            LlmProviderKind::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    #[default]
    Kokoro,
    ElevenLabs,
    Deepgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    #[default]
    Whisper,
    Deepgram,
}

/// Whether the agent answers out loud or silently builds meeting notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    #[default]
    Conversational,
    Analyst,
}

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Immutable configuration snapshot handed to the supervisor at `create`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentConfig {
    pub name: String,
    pub meeting_url: String,
    #[serde(default)]
    pub llm_provider: LlmProviderKind,
    #[serde(default = "default_model")]
    pub llm_model: String,
    #[serde(default)]
    pub tts_provider: TtsProvider,
    #[serde(default)]
    pub stt_provider: SttProvider,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality_prompt: Option<String>,
    /// Only respond when the agent's name appears in pending speech.
    #[serde(default)]
    pub name_trigger: bool,
    #[serde(default = "default_true")]
    pub auto_join: bool,
    #[serde(default)]
    pub conversation_mode: ConversationMode,
    /// Quiet period before pending speech is finalized into an utterance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utterance_tail_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_speech_event_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stt_tasks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_queue_size: Option<u32>,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub stt_args: HashMap<String, Value>,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub tts_args: HashMap<String, Value>,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub vad_args: HashMap<String, Value>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

pub const DEFAULT_DEBOUNCE_SECONDS: f64 = 2.0;
pub const DEFAULT_UTTERANCE_TAIL_SECONDS: f64 = 1.0;

impl AgentConfig {
    pub fn new(name: impl Into<String>, meeting_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meeting_url: meeting_url.into(),
            llm_provider: LlmProviderKind::default(),
            llm_model: default_model(),
            tts_provider: TtsProvider::default(),
            stt_provider: SttProvider::default(),
            language: default_language(),
            custom_prompt: None,
            personality_prompt: None,
            name_trigger: false,
            auto_join: true,
            conversation_mode: ConversationMode::default(),
            debounce_seconds: None,
            utterance_tail_seconds: None,
            no_speech_event_delay: None,
            max_stt_tasks: None,
            window_queue_size: None,
            stt_args: HashMap::new(),
            tts_args: HashMap::new(),
            vad_args: HashMap::new(),
            env_vars: HashMap::new(),
        }
    }

    /// Rejects configurations that could never start.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig("name must not be empty".into()));
        }
        if self.meeting_url.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "meeting_url must not be empty".into(),
            ));
        }
        if self.llm_model.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "llm_model must not be empty".into(),
            ));
        }
        for (field, value) in [
            ("debounce_seconds", self.debounce_seconds),
            ("utterance_tail_seconds", self.utterance_tail_seconds),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(SupervisorError::InvalidConfig(format!(
                        "{field} must be a non-negative number"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_seconds.unwrap_or(DEFAULT_DEBOUNCE_SECONDS))
    }

    /// Session settings forwarded to the meeting backend when connecting.
    pub fn session_settings(&self) -> Value {
        let mut controller = serde_json::Map::new();
        controller.insert(
            "utterance_tail_seconds".into(),
            json!(
                self.utterance_tail_seconds
                    .unwrap_or(DEFAULT_UTTERANCE_TAIL_SECONDS)
            ),
        );
        if let Some(delay) = self.no_speech_event_delay {
            controller.insert("no_speech_event_delay".into(), json!(delay));
        }
        if let Some(max) = self.max_stt_tasks {
            controller.insert("max_stt_tasks".into(), json!(max));
        }
        if let Some(size) = self.window_queue_size {
            controller.insert("window_queue_size".into(), json!(size));
        }

        json!({
            "name": self.name,
            "language": self.language,
            "tts": self.tts_provider,
            "stt": self.stt_provider,
            "transcription_controller_args": controller,
            "stt_args": self.stt_args,
            "tts_args": self.tts_args,
            "vad_args": self.vad_args,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// A copy of one supervised agent. Callers never see the supervisor's own entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Agent {
    pub id: String,
    pub config: AgentConfig,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MeetingInfo {
    pub url: String,
    pub agent_count: usize,
    pub agent_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UsageStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_meetings: usize,
    pub uptime_seconds: i64,
    pub api_calls: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerRole {
    Participant,
    Agent,
}

/// One transcript fragment as reported by the meeting backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub start: f64,
    #[serde(default)]
    pub end: f64,
}

impl TranscriptSegment {
    pub fn new(speaker: &str, text: &str, start: f64, end: f64) -> Self {
        Self {
            text: text.to_string(),
            speaker: Some(speaker.to_string()),
            role: None,
            start,
            end,
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    /// The backend tags synthetic speech as `assistant`; anything it does not
    /// recognise is treated as untagged.
    pub fn speaker_role(&self) -> Option<SpeakerRole> {
        match self.role.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("assistant") | Some("agent") => Some(SpeakerRole::Agent),
            Some("participant") | Some("user") => Some(SpeakerRole::Participant),
            _ => None,
        }
    }

    pub fn speaker_label(&self) -> &str {
        self.speaker
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("Participant")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEntry {
    pub speaker: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(AgentStatus::Created.can_transition_to(AgentStatus::Starting));
        assert!(AgentStatus::Starting.can_transition_to(AgentStatus::Error));
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::Error));
        assert!(AgentStatus::Stopped.can_transition_to(AgentStatus::Starting));
        assert!(AgentStatus::Error.can_transition_to(AgentStatus::Starting));

        assert!(!AgentStatus::Stopped.can_transition_to(AgentStatus::Running));
        assert!(!AgentStatus::Created.can_transition_to(AgentStatus::Error));
        assert!(!AgentStatus::Stopping.can_transition_to(AgentStatus::Running));
    }

    #[test]
    fn test_agent_config_defaults_from_json() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"name": "Ava", "meeting_url": "https://meet.example.com/abc"}"#,
        )
        .unwrap();

        assert_eq!(config.llm_provider, LlmProviderKind::OpenAi);
        assert!(config.auto_join);
        assert!(!config.name_trigger);
        assert_eq!(config.conversation_mode, ConversationMode::Conversational);
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.language, "en");
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let result: Result<AgentConfig, _> = serde_json::from_str(
            r#"{"name": "Ava", "meeting_url": "u", "llm_provider": "mystery"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_debounce() {
        let mut config = AgentConfig::new("Ava", "https://meet.example.com/abc");
        config.debounce_seconds = Some(-1.0);
        assert!(matches!(
            config.validate(),
            Err(SupervisorError::InvalidConfig(_))
        ));

        config.debounce_seconds = Some(0.5);
        assert!(config.validate().is_ok());

        config.meeting_url = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_settings_shape() {
        let mut config = AgentConfig::new("Ava", "https://meet.example.com/abc");
        config.max_stt_tasks = Some(3);
        config
            .vad_args
            .insert("threshold".into(), serde_json::json!(0.5));

        let settings = config.session_settings();
        assert_eq!(settings["name"], "Ava");
        assert_eq!(settings["tts"], "kokoro");
        assert_eq!(settings["stt"], "whisper");
        assert_eq!(
            settings["transcription_controller_args"]["utterance_tail_seconds"],
            1.0
        );
        assert_eq!(settings["transcription_controller_args"]["max_stt_tasks"], 3);
        assert_eq!(settings["vad_args"]["threshold"], 0.5);
    }

    #[test]
    fn test_segment_role_parsing() {
        let seg = TranscriptSegment::new("Ava", "hi", 0.0, 1.0).with_role("assistant");
        assert_eq!(seg.speaker_role(), Some(SpeakerRole::Agent));

        let seg = TranscriptSegment::new("Bob", "hi", 0.0, 1.0).with_role("Participant");
        assert_eq!(seg.speaker_role(), Some(SpeakerRole::Participant));

        let seg = TranscriptSegment::new("Bob", "hi", 0.0, 1.0).with_role("moderator");
        assert_eq!(seg.speaker_role(), None);
    }

    #[test]
    fn test_segment_deserializes_without_optional_fields() {
        let seg: TranscriptSegment =
            serde_json::from_str(r#"{"text": "hello", "start": 1.5}"#).unwrap();
        assert_eq!(seg.speaker_label(), "Participant");
        assert_eq!(seg.end, 0.0);
    }
}
