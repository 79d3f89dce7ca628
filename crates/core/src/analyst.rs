//! Silent meeting analysis.
//!
//! Analyst-mode agents never speak. Every utterance is appended to a running
//! transcript, and periodically the transcript is sent through five
//! schema-constrained model passes (summary, key points, action items,
//! topics, sentiment) whose results are merged into [`AnalysisData`].

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::consolidation::Utterance;
use crate::llm::{LlmProvider, strip_code_fence};
use crate::models::LogLevel;
use crate::supersession::LogSink;

/// Refresh the analysis at least this often while speech keeps arriving.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// ...and whenever the transcript grows by this many entries.
pub const REFRESH_EVERY_ENTRIES: usize = 10;
const RECENT_ENTRIES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: String,
    pub text: String,
    pub is_agent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ActionItem {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub priority: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TopicDiscussion {
    pub topic: String,
    pub summary: String,
    pub participants: Vec<String>,
    pub duration_minutes: f64,
}

/// Everything the analyst knows about one meeting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AnalysisData {
    pub meeting_id: String,
    pub meeting_url: String,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub transcript: Vec<TranscriptEntry>,
    pub summary: String,
    pub key_points: Vec<String>,
    pub action_items: Vec<ActionItem>,
    pub topics: Vec<TopicDiscussion>,
    pub participants: Vec<String>,
    pub duration_minutes: f64,
    pub word_count: usize,
    pub sentiment: String,
    pub keywords: Vec<String>,
}

impl AnalysisData {
    fn new(meeting_id: &str, meeting_url: &str) -> Self {
        let now = Utc::now();
        Self {
            meeting_id: meeting_id.to_string(),
            meeting_url: meeting_url.to_string(),
            start_time: now,
            last_updated: now,
            transcript: Vec::new(),
            summary: String::new(),
            key_points: Vec::new(),
            action_items: Vec::new(),
            topics: Vec::new(),
            participants: Vec::new(),
            duration_minutes: 0.0,
            word_count: 0,
            sentiment: String::new(),
            keywords: Vec::new(),
        }
    }

    /// Renders the analysis as a markdown report.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Meeting Analysis Report\n");
        let _ = writeln!(out, "**Meeting URL:** {}", self.meeting_url);
        let _ = writeln!(
            out,
            "**Start Time:** {}",
            self.start_time.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(
            out,
            "**Last Updated:** {}",
            self.last_updated.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(out, "**Duration:** {:.1} minutes", self.duration_minutes);
        let _ = writeln!(out, "**Participants:** {}", self.participants.join(", "));
        let _ = writeln!(out, "**Total Words:** {}", self.word_count);
        if !self.sentiment.is_empty() {
            let _ = writeln!(out, "**Overall Sentiment:** {}", self.sentiment);
        }
        out.push('\n');

        if !self.summary.is_empty() {
            let _ = writeln!(out, "## Summary\n\n{}\n", self.summary);
        }

        if !self.key_points.is_empty() {
            out.push_str("## Key Points\n\n");
            for (i, point) in self.key_points.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, point);
            }
            out.push('\n');
        }

        if !self.action_items.is_empty() {
            out.push_str("## Action Items\n\n");
            for item in &self.action_items {
                let _ = write!(out, "- **{}** ({} priority)", item.description, item.priority);
                if let Some(assignee) = &item.assignee {
                    let _ = write!(out, " - Assigned to: {assignee}");
                }
                if let Some(due) = &item.due_date {
                    let _ = write!(out, " - Due: {due}");
                }
                let _ = writeln!(out, " - Status: {}", item.status);
            }
            out.push('\n');
        }

        if !self.topics.is_empty() {
            out.push_str("## Discussion Topics\n\n");
            for topic in &self.topics {
                let _ = writeln!(out, "### {}", topic.topic);
                let _ = writeln!(out, "**Duration:** {:.1} minutes", topic.duration_minutes);
                let _ = writeln!(out, "**Participants:** {}", topic.participants.join(", "));
                let _ = writeln!(out, "**Summary:** {}\n", topic.summary);
            }
        }

        if !self.keywords.is_empty() {
            let _ = writeln!(out, "## Keywords\n\n{}\n", self.keywords.join(", "));
        }

        if !self.transcript.is_empty() {
            out.push_str("## Full Transcript\n\n");
            for entry in &self.transcript {
                let _ = writeln!(
                    out,
                    "[{}] **{}:** {}\n",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.speaker,
                    entry.text
                );
            }
        }

        out
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SummaryResponse {
    /// A comprehensive summary of the meeting discussion
    summary: String,
    /// Main themes discussed in the meeting
    #[serde(default)]
    #[allow(dead_code)]
    key_themes: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct KeyPointsResponse {
    /// Key points and important information from the meeting
    key_points: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ActionItemDraft {
    /// Description of the action item
    description: String,
    /// Person responsible for the action item
    #[serde(default)]
    assignee: Option<String>,
    /// Priority level of the action item
    #[serde(default)]
    priority: Option<Priority>,
    /// Due date for the action item, if mentioned
    #[serde(default)]
    due_date: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ActionItemsResponse {
    action_items: Vec<ActionItemDraft>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicDraft {
    /// Name or title of the discussion topic
    topic: String,
    /// Brief summary of what was discussed
    summary: String,
    /// Participants involved in this topic
    #[serde(default)]
    participants: Vec<String>,
    /// Duration of the topic discussion in minutes
    #[serde(default)]
    duration_minutes: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicsResponse {
    topics: Vec<TopicDraft>,
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl Sentiment {
    fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
            Sentiment::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SentimentResponse {
    /// Overall sentiment of the meeting discussion
    sentiment: Sentiment,
    /// Important keywords and phrases from the discussion
    #[serde(default)]
    keywords: Vec<String>,
}

fn schema_of<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T)).unwrap_or_default();
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
    }
    value
}

fn parse_structured<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(strip_code_fence(raw)).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Summary,
    KeyPoints,
    ActionItems,
    Topics,
    Sentiment,
}

impl Pass {
    fn label(self) -> &'static str {
        match self {
            Pass::Summary => "summary",
            Pass::KeyPoints => "key_points",
            Pass::ActionItems => "action_items",
            Pass::Topics => "topics",
            Pass::Sentiment => "sentiment_keywords",
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            Pass::Summary => {
                "Analyze this meeting transcript and provide a comprehensive summary. Focus on:\n\
                 - Main topics discussed\n- Key decisions made\n- Important information shared\n\
                 - Overall meeting progress and outcomes"
            }
            Pass::KeyPoints => {
                "Extract the most important key points from this meeting transcript. Focus on:\n\
                 - Important decisions or agreements\n- Critical information shared\n\
                 - Action-oriented statements\n- Questions that need answers\n- Commitments made"
            }
            Pass::ActionItems => {
                "Identify all actionable items from this meeting transcript. Look for tasks that \
                 need to be completed, follow-ups, assignments given to specific people and \
                 deadlines mentioned. For each action item, specify a description, who is \
                 responsible (if mentioned), a priority level (high/medium/low) and a due date \
                 (if mentioned)."
            }
            Pass::Topics => {
                "Analyze this meeting transcript and identify the main discussion topics. For \
                 each topic, provide a name, a brief summary of what was discussed, the key \
                 participants involved and an approximate duration."
            }
            Pass::Sentiment => {
                "Analyze the sentiment and extract keywords from this meeting transcript. \
                 Determine the overall sentiment of the discussion and identify the most \
                 important keywords and phrases."
            }
        }
    }

    fn schema(self) -> Value {
        match self {
            Pass::Summary => schema_of::<SummaryResponse>(),
            Pass::KeyPoints => schema_of::<KeyPointsResponse>(),
            Pass::ActionItems => schema_of::<ActionItemsResponse>(),
            Pass::Topics => schema_of::<TopicsResponse>(),
            Pass::Sentiment => schema_of::<SentimentResponse>(),
        }
    }
}

const PASSES: [Pass; 5] = [
    Pass::Summary,
    Pass::KeyPoints,
    Pass::ActionItems,
    Pass::Topics,
    Pass::Sentiment,
];

fn is_valid_action(description: &str) -> bool {
    let description = description.trim();
    description.chars().count() >= 3
        && description.chars().any(|c| c.is_alphabetic())
        && !description.starts_with(['{', '}', '[', ']'])
}

/// Settings that shape one analyst.
#[derive(Debug, Clone, Default)]
pub struct AnalystSettings {
    pub meeting_url: String,
    pub personality_prompt: Option<String>,
    pub persist_dir: Option<PathBuf>,
}

/// Per-agent meeting analyst.
pub struct Analyst {
    agent_id: String,
    settings: AnalystSettings,
    provider: Option<Arc<dyn LlmProvider>>,
    data: RwLock<AnalysisData>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_lock: tokio::sync::Mutex<()>,
    tracker: TaskTracker,
}

impl Analyst {
    pub fn new(
        agent_id: &str,
        settings: AnalystSettings,
        provider: Option<Arc<dyn LlmProvider>>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            data: RwLock::new(AnalysisData::new(agent_id, &settings.meeting_url)),
            settings,
            provider,
            last_refresh: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            tracker,
        }
    }

    /// Appends an utterance to the transcript and schedules a refresh when one
    /// is due. Returns whether a refresh was scheduled.
    ///
    /// The refresh runs under `run` and reports failures through `log`.
    pub fn ingest(
        self: &Arc<Self>,
        utterance: &Utterance,
        run: &CancellationToken,
        log: &LogSink,
    ) -> bool {
        let text = utterance.text();
        if text.is_empty() {
            return false;
        }
        let speaker = utterance.speaker().to_string();

        let entries = {
            let mut data = self.data.write();
            data.transcript.push(TranscriptEntry {
                timestamp: utterance.finalized_at,
                speaker: speaker.clone(),
                text: text.clone(),
                is_agent: false,
            });
            if !data.participants.contains(&speaker) {
                data.participants.push(speaker);
            }
            data.word_count += text.split_whitespace().count();
            data.last_updated = Utc::now();
            data.duration_minutes =
                (data.last_updated - data.start_time).num_milliseconds() as f64 / 60_000.0;
            data.transcript.len()
        };

        let due = match *self.last_refresh.lock() {
            None => true,
            Some(at) => at.elapsed() >= REFRESH_INTERVAL,
        } || entries % REFRESH_EVERY_ENTRIES == 0;

        if due {
            let analyst = Arc::clone(self);
            let run = run.clone();
            let log = Arc::clone(log);
            self.tracker
                .spawn(async move { analyst.refresh(&run, &log).await });
        }
        due
    }

    /// Runs every analysis pass against the recent transcript. Concurrent
    /// calls collapse into the one already running. Cancelling `run` abandons
    /// the refresh without persisting.
    pub async fn refresh(&self, run: &CancellationToken, log: &LogSink) {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!(agent_id = %self.agent_id, "analysis already running");
            return;
        };
        *self.last_refresh.lock() = Some(Instant::now());

        let Some(provider) = self.provider.as_ref().filter(|p| p.is_available()) else {
            log(
                LogLevel::Warn,
                "No LLM provider available, meeting analysis skipped".to_string(),
            );
            return;
        };

        let transcript = {
            let data = self.data.read();
            let skip = data.transcript.len().saturating_sub(RECENT_ENTRIES);
            data.transcript
                .iter()
                .skip(skip)
                .map(|e| format!("[{}] {}: {}", e.timestamp.format("%H:%M:%S"), e.speaker, e.text))
                .collect::<Vec<_>>()
                .join("\n")
        };
        if transcript.is_empty() {
            return;
        }

        info!(agent_id = %self.agent_id, "updating meeting analysis");
        for pass in PASSES {
            let prompt = self.prompt(pass, &transcript);
            let schema = pass.schema();
            let result = tokio::select! {
                _ = run.cancelled() => {
                    debug!(agent_id = %self.agent_id, pass = pass.label(), "analysis cancelled");
                    return;
                }
                result = provider.call_with_schema(&prompt, &schema) => result,
            };
            match result {
                Ok(raw) => {
                    if !self.apply(pass, &raw) {
                        log(
                            LogLevel::Warn,
                            format!("Analysis {} returned an unreadable response", pass.label()),
                        );
                    }
                }
                Err(e) => log(
                    LogLevel::Error,
                    format!("Analysis {} failed: {e}", pass.label()),
                ),
            }
        }

        self.data.write().last_updated = Utc::now();
        self.persist().await;
    }

    fn prompt(&self, pass: Pass, transcript: &str) -> String {
        let mut prompt = String::new();
        if let Some(focus) = self
            .settings
            .personality_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            let _ = write!(prompt, "Analyst focus: {}\n\n", focus.trim());
        }
        let _ = write!(prompt, "{}\n\nTranscript:\n{}", pass.instructions(), transcript);
        prompt
    }

    fn apply(&self, pass: Pass, raw: &str) -> bool {
        match pass {
            Pass::Summary => {
                let Some(parsed) = parse_structured::<SummaryResponse>(raw) else {
                    return false;
                };
                self.data.write().summary = parsed.summary.trim().to_string();
            }
            Pass::KeyPoints => {
                let Some(parsed) = parse_structured::<KeyPointsResponse>(raw) else {
                    return false;
                };
                let mut points: Vec<String> = Vec::new();
                for point in parsed.key_points {
                    let point = point.trim().to_string();
                    if !point.is_empty() && !points.contains(&point) {
                        points.push(point);
                    }
                }
                self.data.write().key_points = points;
            }
            Pass::ActionItems => {
                let Some(parsed) = parse_structured::<ActionItemsResponse>(raw) else {
                    return false;
                };
                let mut data = self.data.write();
                for draft in parsed.action_items {
                    let description = draft.description.trim().to_string();
                    if !is_valid_action(&description) {
                        continue;
                    }
                    let lower = description.to_lowercase();
                    let exists = data.action_items.iter().any(|item| {
                        let known = item.description.to_lowercase();
                        known.contains(&lower) || lower.contains(&known)
                    });
                    if exists {
                        continue;
                    }
                    data.action_items.push(ActionItem {
                        id: Uuid::new_v4().to_string(),
                        description,
                        assignee: draft.assignee.filter(|a| !a.trim().is_empty()),
                        due_date: draft.due_date.filter(|d| !d.trim().is_empty()),
                        priority: draft.priority.unwrap_or(Priority::Medium).as_str().to_string(),
                        status: "pending".to_string(),
                        created_at: Utc::now(),
                    });
                }
            }
            Pass::Topics => {
                let Some(parsed) = parse_structured::<TopicsResponse>(raw) else {
                    return false;
                };
                self.data.write().topics = parsed
                    .topics
                    .into_iter()
                    .map(|t| TopicDiscussion {
                        topic: t.topic,
                        summary: t.summary,
                        participants: t.participants,
                        duration_minutes: t.duration_minutes.unwrap_or_default(),
                    })
                    .collect();
            }
            Pass::Sentiment => {
                let Some(parsed) = parse_structured::<SentimentResponse>(raw) else {
                    return false;
                };
                let mut data = self.data.write();
                data.sentiment = parsed.sentiment.as_str().to_string();
                data.keywords = parsed.keywords;
            }
        }
        true
    }

    async fn persist(&self) {
        let Some(dir) = self.settings.persist_dir.clone() else {
            return;
        };
        let (path, body) = {
            let data = self.data.read();
            let path = dir.join(format!(
                "meeting_analysis_{}_{}.json",
                self.agent_id,
                data.start_time.timestamp()
            ));
            (path, serde_json::to_vec_pretty(&*data))
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                error!(agent_id = %self.agent_id, error = %e, "failed to serialize analysis");
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(agent_id = %self.agent_id, error = %e, "failed to create analysis directory");
            return;
        }
        if let Err(e) = tokio::fs::write(&path, body).await {
            error!(agent_id = %self.agent_id, path = %path.display(), error = %e, "failed to save analysis");
        }
    }

    /// A copy of the current analysis.
    pub fn snapshot(&self) -> AnalysisData {
        self.data.read().clone()
    }

    pub fn formatted(&self) -> String {
        self.data.read().to_markdown()
    }
}
