//! Event records distributed through the [`crate::hub::Hub`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::consolidation::Utterance;
use crate::models::{AgentStatus, LogEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Log,
    Utterance,
}

/// A single `{type, agent_id, data, timestamp}` record. Built once and shared
/// read-only between every subscriber it is delivered to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketMessage {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub agent_id: String,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl WebSocketMessage {
    fn new(kind: EventKind, agent_id: &str, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind,
            agent_id: agent_id.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn status(agent_id: &str, status: AgentStatus) -> Self {
        Self::new(EventKind::Status, agent_id, json!({ "status": status }))
    }

    pub fn log(agent_id: &str, entry: &LogEntry) -> Self {
        Self::new(
            EventKind::Log,
            agent_id,
            json!({
                "level": entry.level,
                "message": entry.message,
                "timestamp": entry.timestamp,
            }),
        )
    }

    pub fn utterance(agent_id: &str, utterance: &Utterance) -> Self {
        Self::new(
            EventKind::Utterance,
            agent_id,
            json!({
                "speaker": utterance.speaker(),
                "text": utterance.text(),
                "hash": utterance.hash,
                "start": utterance.start(),
                "end": utterance.end(),
                "segments": utterance.segments,
            }),
        )
    }
}
