use chrono::Utc;
use std::collections::VecDeque;

use crate::models::ConversationEntry;

pub const HISTORY_CAPACITY: usize = 20;
pub const CONTEXT_WINDOW: usize = 10;
pub const NO_CONTEXT: &str = "No previous context.";

/// Bounded per-agent conversation history used as model context.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: VecDeque<ConversationEntry>,
    capacity: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl ConversationHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Appends an entry, evicting the oldest once full.
    pub fn push(&mut self, speaker: &str, message: &str) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ConversationEntry {
            speaker: speaker.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest `n` entries, oldest first.
    pub fn window(&self, n: usize) -> Vec<ConversationEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Renders the newest `n` entries as `speaker: message` lines.
    pub fn render(&self, n: usize) -> String {
        let window = self.window(n);
        if window.is_empty() {
            return NO_CONTEXT.to_string();
        }
        window
            .iter()
            .map(|e| format!("{}: {}", e.speaker, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
