//! At most one response task per agent.
//!
//! Every finalized utterance gets its own task. Dispatching a new one cancels
//! whatever task the agent still had in flight, so stale replies are never
//! spoken. Cancellation is the expected outcome of people talking over each
//! other and is reported as [`ResponseOutcome::Superseded`], never as an error.
//!
//! Superseded tasks may still be winding down when their successor starts;
//! [`ResponseEngine::drain`] waits for all of an agent's tasks, old and new.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span};

use crate::analyst::Analyst;
use crate::connection::SessionConnection;
use crate::consolidation::{Utterance, UtteranceLedger, UtteranceState};
use crate::context::{CONTEXT_WINDOW, ConversationHistory};
use crate::llm::LlmProvider;
use crate::models::{ConversationMode, LogLevel};
use crate::responder::{Responder, parse_reply};

/// Writes a line into the owning agent's log.
pub type LogSink = Arc<dyn Fn(LogLevel, String) + Send + Sync>;

/// Everything a response task needs for one agent run.
pub struct ResponderContext {
    pub agent_id: String,
    pub mode: ConversationMode,
    pub responder: Responder,
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub connection: Arc<dyn SessionConnection>,
    pub history: Arc<Mutex<ConversationHistory>>,
    pub analyst: Option<Arc<Analyst>>,
    pub ledger: Arc<UtteranceLedger>,
    /// Token of the agent run. Cancelled when the agent stops.
    pub run: CancellationToken,
    /// Held across the speak call so two tasks never speak at once.
    pub speak_gate: tokio::sync::Mutex<()>,
    pub log: LogSink,
}

impl ResponderContext {
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        (self.log)(level, message.into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Spoken(String),
    Analyzed,
    Superseded,
    Skipped(&'static str),
    Failed(String),
}

struct ActiveTask {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct AgentTasks {
    current: Option<ActiveTask>,
    /// Every task spawned for the agent that has not finished yet.
    running: TaskTracker,
}

/// Tracks the current response task of every agent.
#[derive(Clone)]
pub struct ResponseEngine {
    tasks: Arc<Mutex<HashMap<String, AgentTasks>>>,
    next_id: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl ResponseEngine {
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            tracker,
        }
    }

    /// Starts the response task for `utterance`, cancelling the agent's
    /// previous task first.
    ///
    /// # Arguments
    ///
    /// * `parent` - The agent's lifetime token; the task token derives from it.
    /// * `ctx` - Collaborators of the agent run.
    /// * `utterance` - The finalized utterance to answer.
    pub fn dispatch(
        &self,
        parent: &CancellationToken,
        ctx: Arc<ResponderContext>,
        utterance: Utterance,
    ) -> JoinHandle<ResponseOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        let running = {
            let mut tasks = self.tasks.lock();
            let agent = tasks.entry(ctx.agent_id.clone()).or_default();
            let previous = agent.current.replace(ActiveTask {
                id,
                cancel: cancel.clone(),
            });
            if let Some(previous) = previous {
                debug!(agent_id = %ctx.agent_id, superseded = previous.id, "cancelling previous response task");
                previous.cancel.cancel();
            }
            agent.running.clone()
        };

        let tasks = Arc::clone(&self.tasks);
        let span = info_span!("respond", agent_id = %ctx.agent_id, hash = %utterance.hash);
        self.tracker.spawn(running.track_future(
            async move {
                let outcome = respond(&ctx, &utterance, &cancel).await;
                if let Some(agent) = tasks.lock().get_mut(&ctx.agent_id) {
                    if agent.current.as_ref().is_some_and(|t| t.id == id) {
                        agent.current = None;
                    }
                }
                debug!(?outcome, "response task finished");
                outcome
            }
            .instrument(span),
        ))
    }

    /// Cancels the agent's in-flight task, if any.
    pub fn cancel(&self, agent_id: &str) {
        if let Some(task) = self
            .tasks
            .lock()
            .get_mut(agent_id)
            .and_then(|agent| agent.current.take())
        {
            task.cancel.cancel();
        }
    }

    /// Cancels the agent's in-flight task and waits until every task spawned
    /// for the agent has finished. A speak call already under way is allowed
    /// to complete.
    pub async fn drain(&self, agent_id: &str) {
        let Some(agent) = self.tasks.lock().remove(agent_id) else {
            return;
        };
        if let Some(task) = agent.current {
            task.cancel.cancel();
        }
        agent.running.close();
        agent.running.wait().await;
    }

    pub fn cancel_all(&self) {
        for agent in self.tasks.lock().values_mut() {
            if let Some(task) = agent.current.take() {
                task.cancel.cancel();
            }
        }
    }

    pub fn in_flight(&self, agent_id: &str) -> bool {
        self.tasks
            .lock()
            .get(agent_id)
            .is_some_and(|agent| agent.current.is_some())
    }
}

async fn respond(
    ctx: &ResponderContext,
    utterance: &Utterance,
    cancel: &CancellationToken,
) -> ResponseOutcome {
    let text = utterance.text();
    if text.trim().is_empty() {
        return ResponseOutcome::Skipped("empty utterance");
    }
    if ctx.run.is_cancelled() {
        return ResponseOutcome::Superseded;
    }
    let speaker = utterance.speaker().to_string();

    if ctx.mode == ConversationMode::Analyst {
        if let Some(analyst) = &ctx.analyst {
            analyst.ingest(utterance, &ctx.run, &ctx.log);
        }
        return ResponseOutcome::Analyzed;
    }

    if ctx.ledger.state(&utterance.hash) == Some(UtteranceState::Delivered) {
        return ResponseOutcome::Skipped("already delivered");
    }

    let context = {
        let mut history = ctx.history.lock();
        let context = history.render(CONTEXT_WINDOW);
        history.push(&speaker, &text);
        context
    };
    ctx.log(LogLevel::Info, format!("Processing utterance from {speaker}: {text}"));

    if cancel.is_cancelled() {
        return ResponseOutcome::Superseded;
    }
    ctx.ledger.advance(&utterance.hash, UtteranceState::SentToModel);

    let reply = tokio::select! {
        _ = cancel.cancelled() => return ResponseOutcome::Superseded,
        reply = generate(ctx, &speaker, &text, &context) => reply,
    };
    ctx.ledger.advance(&utterance.hash, UtteranceState::ModelDone);
    if cancel.is_cancelled() {
        return ResponseOutcome::Superseded;
    }
    if reply.is_empty() {
        return ResponseOutcome::Skipped("empty reply");
    }

    let _gate = tokio::select! {
        _ = cancel.cancelled() => return ResponseOutcome::Superseded,
        gate = ctx.speak_gate.lock() => gate,
    };
    if cancel.is_cancelled() {
        return ResponseOutcome::Superseded;
    }
    if let Err(e) = ctx.connection.speak(&reply).await {
        ctx.log(LogLevel::Error, format!("Failed to speak response: {e}"));
        return ResponseOutcome::Failed(e.to_string());
    }

    ctx.ledger.advance(&utterance.hash, UtteranceState::Delivered);
    ctx.history.lock().push(ctx.responder.agent_name(), &reply);
    ctx.log(LogLevel::Info, format!("Responded to {speaker}: {reply}"));
    ResponseOutcome::Spoken(reply)
}

async fn generate(ctx: &ResponderContext, speaker: &str, text: &str, context: &str) -> String {
    let Some(provider) = ctx.provider.as_ref().filter(|p| p.is_available()) else {
        ctx.log(LogLevel::Warn, "No LLM provider available, using fallback reply");
        return ctx.responder.fallback_reply(speaker, text);
    };
    let prompt = ctx.responder.build_prompt(speaker, text, context);
    match provider.call(&prompt).await {
        Ok(raw) => parse_reply(&raw),
        Err(e) => {
            ctx.log(LogLevel::Error, format!("LLM call via {} failed: {e}", provider.name()));
            ctx.responder.fallback_reply(speaker, text)
        }
    }
}
