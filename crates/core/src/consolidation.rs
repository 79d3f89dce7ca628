//! Turns the raw transcript feed into discrete, deduplicated utterances.
//!
//! Segments arrive in batches from both push notifications and polling, so
//! the same segment is routinely seen several times. Participant speech is
//! filtered by a start-offset watermark and accumulated until a quiet period
//! (the debounce) elapses; agent speech is only recorded so it is never
//! mistaken for new input.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::models::{AgentConfig, SpeakerRole, TranscriptSegment};

/// Maximum gap, in transcript seconds, between two same-speaker segments that
/// still merge into one block.
pub const MERGE_GAP_SECONDS: f64 = 2.0;

/// Marker the backend embeds in echoed synthetic speech.
const SYNTHETIC_VOICE_MARKER: &str = "[heard:";
const SYNTHETIC_SPEAKER: &str = "assistant";

const SEEN_AGENT_TEXT_CAP: usize = 100;
const LEDGER_CAP: usize = 500;
/// Segments held while waiting for the agent's name. The oldest go first.
const PENDING_CAP: usize = 50;

/// A finalized block of participant speech.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Utterance {
    pub segments: Vec<TranscriptSegment>,
    pub hash: String,
    pub finalized_at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(segments: Vec<TranscriptSegment>) -> Self {
        let mut utterance = Self {
            segments,
            hash: String::new(),
            finalized_at: Utc::now(),
        };
        utterance.hash = content_hash(utterance.speaker(), utterance.start(), &utterance.text());
        utterance
    }

    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The last named speaker in the block.
    pub fn speaker(&self) -> &str {
        self.segments
            .iter()
            .rev()
            .find_map(|s| s.speaker.as_deref().filter(|n| !n.is_empty()))
            .unwrap_or("Participant")
    }

    pub fn start(&self) -> f64 {
        self.segments.first().map(|s| s.start).unwrap_or_default()
    }

    pub fn end(&self) -> f64 {
        self.segments.last().map(|s| s.end).unwrap_or_default()
    }
}

/// SHA-256 hex digest identifying an utterance across its lifecycle.
///
/// The start offset is part of the digest: the same words said again later
/// in the meeting are a new utterance.
pub fn content_hash(speaker: &str, start: f64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(speaker.as_bytes());
    hasher.update(b"\n");
    hasher.update(format!("{start:.3}").as_bytes());
    hasher.update(b"\n");
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercased, whitespace-collapsed text used for agent-speech dedup.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Decides whether a segment is the agent's own voice echoed back.
///
/// An explicit `assistant` role wins. Otherwise the speaker label is compared
/// against the agent's name, and the backend's synthetic speaker label is
/// accepted only when the text carries the echo marker.
pub fn is_agent_voice(segment: &TranscriptSegment, agent_name: &str) -> bool {
    if segment.speaker_role() == Some(SpeakerRole::Agent) {
        return true;
    }
    let Some(speaker) = segment.speaker.as_deref().map(str::trim) else {
        return false;
    };
    if speaker.is_empty() || speaker.eq_ignore_ascii_case("participant") {
        return false;
    }
    if !agent_name.is_empty() && speaker.eq_ignore_ascii_case(agent_name.trim()) {
        return true;
    }
    speaker.eq_ignore_ascii_case(SYNTHETIC_SPEAKER)
        && segment.text.to_lowercase().contains(SYNTHETIC_VOICE_MARKER)
}

/// Case-insensitive name search. An empty name matches everything.
pub fn mentions_name(text: &str, name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || text.to_lowercase().contains(&name.to_lowercase())
}

/// Sorts segments by start offset and merges same-speaker neighbours whose
/// gap is at most [`MERGE_GAP_SECONDS`].
pub fn merge_segments(mut segments: Vec<TranscriptSegment>) -> Vec<TranscriptSegment> {
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<TranscriptSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let Some(current) = merged.last_mut() {
            if current.speaker == segment.speaker && segment.start - current.end <= MERGE_GAP_SECONDS
            {
                let addition = segment.text.trim();
                if !addition.is_empty() {
                    if !current.text.trim().is_empty() {
                        current.text.push(' ');
                    }
                    current.text.push_str(addition);
                }
                current.end = current.end.max(segment.end);
                continue;
            }
        }
        merged.push(segment);
    }
    merged
}

/// Where an utterance is in its response lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceState {
    Received,
    SentToModel,
    ModelDone,
    Delivered,
}

/// Bounded record of utterance hashes and their lifecycle state.
#[derive(Default)]
pub struct UtteranceLedger {
    states: Mutex<HashMap<String, UtteranceState>>,
}

impl UtteranceLedger {
    /// Records a freshly finalized utterance. Returns `false` if the hash was
    /// already known, in which case its state is left untouched.
    pub fn receive(&self, hash: &str) -> bool {
        let mut states = self.states.lock();
        if states.contains_key(hash) {
            return false;
        }
        if states.len() >= LEDGER_CAP {
            states.clear();
        }
        states.insert(hash.to_string(), UtteranceState::Received);
        true
    }

    /// Moves a hash forward. States never move backwards.
    pub fn advance(&self, hash: &str, state: UtteranceState) {
        let mut states = self.states.lock();
        let entry = states
            .entry(hash.to_string())
            .or_insert(UtteranceState::Received);
        if state > *entry {
            *entry = state;
        }
    }

    pub fn state(&self, hash: &str) -> Option<UtteranceState> {
        self.states.lock().get(hash).copied()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub agent_name: String,
    pub name_trigger: bool,
    pub debounce: Duration,
}

impl From<&AgentConfig> for PipelineSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            agent_name: config.name.clone(),
            name_trigger: config.name_trigger,
            debounce: config.debounce(),
        }
    }
}

/// What one call to [`UtterancePipeline::ingest`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub agent_segments: usize,
    pub queued: usize,
    pub armed: bool,
}

/// Per-agent consolidation state machine.
#[derive(Clone)]
pub struct UtterancePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    settings: PipelineSettings,
    ledger: Arc<UtteranceLedger>,
    state: Mutex<PendingState>,
    consumers: Mutex<Vec<mpsc::UnboundedSender<Utterance>>>,
}

#[derive(Default)]
struct PendingState {
    joined: bool,
    closed: bool,
    pending: Vec<TranscriptSegment>,
    watermark: Option<f64>,
    seen_agent_text: HashSet<String>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl PendingState {
    fn disarm(&mut self) {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl UtterancePipeline {
    pub fn new(settings: PipelineSettings, ledger: Arc<UtteranceLedger>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                settings,
                ledger,
                state: Mutex::new(PendingState::default()),
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a consumer. Each finalized utterance is sent to every
    /// consumer without waiting on any of them.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Utterance> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.consumers.lock().push(tx);
        rx
    }

    /// Marks the meeting as joined or left. Joining restarts the watermark
    /// because the backend restarts transcript offsets for a new session.
    pub fn set_joined(&self, joined: bool) {
        let mut state = self.inner.state.lock();
        if joined && !state.joined {
            state.watermark = None;
        }
        if !joined {
            state.pending.clear();
            state.disarm();
        }
        state.joined = joined;
    }

    /// Feeds one batch of segments through dedup, buffering and debounce.
    pub fn ingest(&self, segments: Vec<TranscriptSegment>) -> IngestReport {
        let settings = &self.inner.settings;
        let mut report = IngestReport::default();
        let mut state = self.inner.state.lock();
        if state.closed || !state.joined {
            return report;
        }

        // Segments inside one batch may arrive out of order, so they are all
        // compared against the watermark as it stood before the batch.
        let floor = state.watermark;
        for segment in segments {
            if segment.text.trim().is_empty() {
                continue;
            }

            if is_agent_voice(&segment, &settings.agent_name) {
                let normalized = normalize(&segment.text);
                if state.seen_agent_text.contains(&normalized) {
                    continue;
                }
                if state.seen_agent_text.len() >= SEEN_AGENT_TEXT_CAP {
                    state.seen_agent_text.clear();
                }
                trace!(text = %normalized, "recorded agent speech");
                state.seen_agent_text.insert(normalized);
                report.agent_segments += 1;
                continue;
            }

            if floor.is_some_and(|w| segment.start <= w) {
                continue;
            }
            let duplicate = state
                .pending
                .iter()
                .any(|p| p.start == segment.start && p.text == segment.text);
            if duplicate {
                continue;
            }
            state.watermark = Some(state.watermark.map_or(segment.start, |w| w.max(segment.start)));
            state.pending.push(segment);
            report.queued += 1;
        }

        if report.queued == 0 || state.pending.is_empty() {
            return report;
        }

        let qualified = !settings.name_trigger
            || state
                .pending
                .iter()
                .any(|s| mentions_name(&s.text, &settings.agent_name));
        if !qualified {
            let excess = state.pending.len().saturating_sub(PENDING_CAP);
            if excess > 0 {
                state.pending.drain(..excess);
            }
            debug!(pending = state.pending.len(), dropped = excess, "waiting for name trigger");
            return report;
        }

        state.disarm();
        let generation = state.timer_generation;
        let inner = Arc::clone(&self.inner);
        let debounce = settings.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.finalize(generation);
        }));
        report.armed = true;
        report
    }

    /// Drops pending speech and disarms the debounce timer. Once closed the
    /// pipeline ignores further input and never emits again.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.pending.clear();
        state.disarm();
        drop(state);
        self.inner.consumers.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn watermark(&self) -> Option<f64> {
        self.inner.state.lock().watermark
    }

    pub fn has_timer(&self) -> bool {
        self.inner
            .state
            .lock()
            .timer
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn ledger(&self) -> &Arc<UtteranceLedger> {
        &self.inner.ledger
    }
}

impl PipelineInner {
    fn finalize(&self, generation: u64) {
        let utterance = {
            let mut state = self.state.lock();
            if state.closed || state.timer_generation != generation {
                return;
            }
            state.timer = None;
            let pending = std::mem::take(&mut state.pending);
            if pending.is_empty() {
                return;
            }
            Utterance::new(merge_segments(pending))
        };

        if !self.ledger.receive(&utterance.hash) {
            debug!(hash = %utterance.hash, "utterance hash already in ledger");
        }
        debug!(
            hash = %utterance.hash,
            speaker = utterance.speaker(),
            segments = utterance.segments.len(),
            "utterance finalized"
        );

        let mut consumers = self.consumers.lock();
        consumers.retain(|tx| tx.send(utterance.clone()).is_ok());
    }
}
