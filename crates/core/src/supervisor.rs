//! Agent Lifecycle Supervisor
//!
//! The supervisor owns the agent map and is the only writer of agent status.
//! Every status change goes through [`Inner::set_status`], which compares
//! against the current value and publishes the change on the hub. Network
//! work (connect, join, close) always happens outside the map lock; the lock
//! is re-acquired only to commit the result.
//!
//! Cancellation is hierarchical: the supervisor's shutdown token is the
//! parent of every agent run token, which in turn is the parent of each
//! response task token.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};
use uuid::Uuid;

use crate::analyst::{AnalysisData, Analyst, AnalystSettings};
use crate::connection::{ConnectionFactory, ConnectionState, SessionConnection, TranscriptNotice};
use crate::consolidation::{PipelineSettings, UtteranceLedger, UtterancePipeline};
use crate::context::ConversationHistory;
use crate::error::SupervisorError;
use crate::events::WebSocketMessage;
use crate::hub::{Hub, HubConfig};
use crate::llm::{LlmProvider, ProviderFactory};
use crate::models::{
    Agent, AgentConfig, AgentStatus, ConversationMode, LogEntry, LogLevel, MeetingInfo,
    UsageStats,
};
use crate::responder::Responder;
use crate::supersession::{LogSink, ResponderContext, ResponseEngine};

/// Number of log lines returned when the caller does not ask for a count.
pub const DEFAULT_LOG_LINES: usize = 200;
const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Capacity ceiling enforced by `create`.
    pub max_agents: usize,
    /// Size of each agent's log ring buffer.
    pub log_buffer_size: usize,
    /// Number of log entries embedded in an [`Agent`] snapshot.
    pub agent_log_tail: usize,
    /// Fallback polling period for the live transcript.
    pub poll_interval: Duration,
    /// How long `stop` waits for a cancelled worker to exit, and again for
    /// its in-flight responses to finish.
    pub stop_timeout: Duration,
    pub analysis_dir: Option<PathBuf>,
    pub hub: HubConfig,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_agents: 10,
            log_buffer_size: 1000,
            agent_log_tail: 100,
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            analysis_dir: None,
            hub: HubConfig::default(),
        }
    }
}

struct AgentRun {
    generation: u64,
    cancel: CancellationToken,
    connection: Arc<dyn SessionConnection>,
    pipeline: UtterancePipeline,
    worker: JoinHandle<()>,
}

struct AgentEntry {
    agent: Agent,
    logs: VecDeque<LogEntry>,
    provider: Arc<dyn LlmProvider>,
    history: Arc<Mutex<ConversationHistory>>,
    analyst: Option<Arc<Analyst>>,
    generation: u64,
    run: Option<AgentRun>,
}

#[derive(Default)]
struct Registry {
    agents: HashMap<String, AgentEntry>,
    meetings: HashMap<String, MeetingInfo>,
}

struct Inner {
    settings: SupervisorSettings,
    registry: Mutex<Registry>,
    hub: Hub,
    connections: Arc<dyn ConnectionFactory>,
    providers: Arc<dyn ProviderFactory>,
    engine: ResponseEngine,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started_at: chrono::DateTime<Utc>,
    running: AtomicBool,
    api_calls: Mutex<HashMap<String, u64>>,
}

/// Everything the per-agent worker owns for one run.
struct WorkerParts {
    config: AgentConfig,
    connection: Arc<dyn SessionConnection>,
    pipeline: UtterancePipeline,
    ctx: Arc<ResponderContext>,
    cancel: CancellationToken,
}

/// Top-level owner of all agents.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Creates the supervisor and starts its event hub.
    ///
    /// # Arguments
    ///
    /// * `settings` - Capacity, buffer sizes and timing.
    /// * `connections` - Builds the Session Connection for each agent run.
    /// * `providers` - Resolves each agent's language-model provider.
    pub fn new(
        settings: SupervisorSettings,
        connections: Arc<dyn ConnectionFactory>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let tracker = TaskTracker::new();
        let hub = Hub::spawn(settings.hub);
        info!(max_agents = settings.max_agents, "agent supervisor started");
        Self {
            inner: Arc::new(Inner {
                settings,
                registry: Mutex::new(Registry::default()),
                hub,
                connections,
                providers,
                engine: ResponseEngine::new(tracker.clone()),
                shutdown: CancellationToken::new(),
                tracker,
                started_at: Utc::now(),
                running: AtomicBool::new(true),
                api_calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), SupervisorError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SupervisorError::NotRunning)
        }
    }

    /// Registers a new agent in the `created` state.
    #[instrument(skip(self, config), fields(name = %config.name))]
    pub fn create(&self, config: AgentConfig) -> Result<Agent, SupervisorError> {
        self.ensure_running()?;
        config.validate()?;
        let provider = self
            .inner
            .providers
            .provider_for(config.llm_provider, &config.llm_model)
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;

        let mut registry = self.inner.registry.lock();
        let max = self.inner.settings.max_agents;
        if registry.agents.len() >= max {
            warn!(max, "agent capacity reached");
            return Err(SupervisorError::Capacity(max));
        }

        let id = loop {
            let candidate = format!("agent_{}", &Uuid::new_v4().simple().to_string()[..8]);
            if !registry.agents.contains_key(&candidate) {
                break candidate;
            }
        };
        let now = Utc::now();

        let analyst = (config.conversation_mode == ConversationMode::Analyst).then(|| {
            Arc::new(Analyst::new(
                &id,
                AnalystSettings {
                    meeting_url: config.meeting_url.clone(),
                    personality_prompt: config.personality_prompt.clone(),
                    persist_dir: self.inner.settings.analysis_dir.clone(),
                },
                Some(Arc::clone(&provider)),
                self.inner.tracker.clone(),
            ))
        });

        let meeting = registry
            .meetings
            .entry(config.meeting_url.clone())
            .or_insert_with(|| MeetingInfo {
                url: config.meeting_url.clone(),
                agent_count: 0,
                agent_ids: Vec::new(),
                created_at: now,
            });
        meeting.agent_ids.push(id.clone());
        meeting.agent_count = meeting.agent_ids.len();

        let name = config.name.clone();
        let mut entry = AgentEntry {
            agent: Agent {
                id: id.clone(),
                config,
                status: AgentStatus::Created,
                created_at: now,
                started_at: None,
                stopped_at: None,
                error_message: None,
                logs: Vec::new(),
            },
            logs: VecDeque::new(),
            provider,
            history: Arc::new(Mutex::new(ConversationHistory::default())),
            analyst,
            generation: 0,
            run: None,
        };
        self.inner
            .add_log(&mut entry, LogLevel::Info, format!("Agent {name} created"));
        let snapshot = self.inner.snapshot(&entry);
        registry.agents.insert(id, entry);
        drop(registry);

        self.inner.count("create_agent");
        Ok(snapshot)
    }

    /// Starts the agent's worker. Starting an agent that is already starting
    /// or running returns its current snapshot.
    #[instrument(skip(self))]
    pub fn start(&self, id: &str) -> Result<Agent, SupervisorError> {
        self.ensure_running()?;
        let mut registry = self.inner.registry.lock();
        let entry = registry
            .agents
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        match entry.agent.status {
            AgentStatus::Starting | AgentStatus::Running => {
                return Ok(self.inner.snapshot(entry));
            }
            AgentStatus::Stopping => return Err(SupervisorError::Busy(id.to_string())),
            AgentStatus::Created | AgentStatus::Stopped | AgentStatus::Error => {}
        }

        entry.generation += 1;
        let generation = entry.generation;
        entry.agent.started_at = Some(Utc::now());
        entry.agent.stopped_at = None;
        entry.agent.error_message = None;
        self.inner.set_status(entry, AgentStatus::Starting);
        self.inner
            .add_log(entry, LogLevel::Info, "Starting agent".to_string());
        if !entry.provider.is_available() {
            let message = format!(
                "LLM provider {} has no credentials configured, replies will use fallback text",
                entry.provider.name()
            );
            self.inner.add_log(entry, LogLevel::Warn, message);
        }

        let config = entry.agent.config.clone();
        let connection = self.inner.connections.create(id, &config);
        let ledger = Arc::new(UtteranceLedger::default());
        let pipeline = UtterancePipeline::new(PipelineSettings::from(&config), Arc::clone(&ledger));
        let cancel = self.inner.shutdown.child_token();
        let ctx = Arc::new(ResponderContext {
            agent_id: id.to_string(),
            mode: config.conversation_mode,
            responder: Responder::from_config(&config),
            provider: Some(Arc::clone(&entry.provider)),
            connection: Arc::clone(&connection),
            history: Arc::clone(&entry.history),
            analyst: entry.analyst.clone(),
            ledger,
            run: cancel.clone(),
            speak_gate: tokio::sync::Mutex::new(()),
            log: self.inner.log_sink(id, generation),
        });

        let parts = WorkerParts {
            config,
            connection: Arc::clone(&connection),
            pipeline: pipeline.clone(),
            ctx,
            cancel: cancel.clone(),
        };
        let supervisor = self.clone();
        let agent_id = id.to_string();
        let span = info_span!("agent", agent_id = %id, generation);
        let worker = self.inner.tracker.spawn(
            async move { supervisor.run_worker(agent_id, generation, parts).await }.instrument(span),
        );

        entry.run = Some(AgentRun {
            generation,
            cancel,
            connection,
            pipeline,
            worker,
        });
        let snapshot = self.inner.snapshot(entry);
        drop(registry);

        self.inner.count("start_agent");
        Ok(snapshot)
    }

    /// Stops the agent and tears its connection down. When this returns the
    /// agent is `stopped` and no further events will be published for it.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<Agent, SupervisorError> {
        let run = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .agents
                .get_mut(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            if matches!(
                entry.agent.status,
                AgentStatus::Stopped | AgentStatus::Stopping
            ) {
                return Ok(self.inner.snapshot(entry));
            }
            self.inner.set_status(entry, AgentStatus::Stopping);
            entry.agent.stopped_at = Some(Utc::now());
            self.inner
                .add_log(entry, LogLevel::Info, "Stopping agent".to_string());
            entry.run.take()
        };

        if let Some(run) = run {
            self.teardown(id, run).await;
        }

        let snapshot = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .agents
                .get_mut(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            self.inner
                .add_log(entry, LogLevel::Info, "Agent stopped".to_string());
            self.inner.set_status(entry, AgentStatus::Stopped);
            self.inner.snapshot(entry)
        };
        self.inner.count("stop_agent");
        Ok(snapshot)
    }

    /// Stops the agent if needed and forgets it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), SupervisorError> {
        self.stop(id).await?;

        let mut registry = self.inner.registry.lock();
        let entry = registry
            .agents
            .remove(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let url = &entry.agent.config.meeting_url;
        let now_empty = match registry.meetings.get_mut(url) {
            Some(meeting) => {
                meeting.agent_ids.retain(|a| a != id);
                meeting.agent_count = meeting.agent_ids.len();
                meeting.agent_ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.meetings.remove(url);
        }
        drop(registry);

        info!(agent_id = id, "agent deleted");
        self.inner.count("delete_agent");
        Ok(())
    }

    /// Joins the meeting for a running agent created with `auto_join`
    /// disabled. The join itself completes in the background and is
    /// abandoned if the agent stops first.
    #[instrument(skip(self))]
    pub fn join_meeting(&self, id: &str) -> Result<(), SupervisorError> {
        let (connection, pipeline, config, generation, cancel) = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .agents
                .get(id)
                .filter(|e| e.agent.status == AgentStatus::Running)
                .ok_or(SupervisorError::AgentNotRunning)?;
            let run = entry.run.as_ref().ok_or(SupervisorError::AgentNotRunning)?;
            match run.connection.state() {
                ConnectionState::Joined => return Err(SupervisorError::AlreadyJoined),
                ConnectionState::Connected => {}
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    return Err(SupervisorError::NotConnected);
                }
            }
            (
                Arc::clone(&run.connection),
                run.pipeline.clone(),
                entry.agent.config.clone(),
                run.generation,
                run.cancel.clone(),
            )
        };
        self.inner.count("join_meeting");

        let inner = Arc::clone(&self.inner);
        let agent_id = id.to_string();
        self.inner.tracker.spawn(async move {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(agent_id, generation, "manual join abandoned");
                    return;
                }
                result = connection.join(&config.meeting_url, &config.name) => result,
            };
            match joined {
                Ok(()) => {
                    pipeline.set_joined(true);
                    inner.log_run(
                        &agent_id,
                        generation,
                        LogLevel::Info,
                        format!("Joined meeting {}", config.meeting_url),
                    );
                }
                Err(e) => {
                    debug!(agent_id, generation, error = %e, "manual join failed");
                    inner.log_run(
                        &agent_id,
                        generation,
                        LogLevel::Error,
                        format!("Failed to join meeting: {e}"),
                    );
                }
            }
        });
        Ok(())
    }

    /// Cancels every agent, closes their connections one by one and waits
    /// for all spawned tasks to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down agent supervisor");
        self.inner.shutdown.cancel();
        self.inner.engine.cancel_all();

        let runs: Vec<(String, AgentRun)> = {
            let mut registry = self.inner.registry.lock();
            registry
                .agents
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let run = entry.run.take()?;
                    self.inner.set_status(entry, AgentStatus::Stopping);
                    entry.agent.stopped_at = Some(Utc::now());
                    Some((id.clone(), run))
                })
                .collect()
        };

        for (id, run) in runs {
            self.teardown(&id, run).await;
            let mut registry = self.inner.registry.lock();
            if let Some(entry) = registry.agents.get_mut(&id) {
                self.inner
                    .add_log(entry, LogLevel::Info, "Agent stopped".to_string());
                self.inner.set_status(entry, AgentStatus::Stopped);
            }
        }

        self.inner.hub.stop().await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("agent supervisor stopped");
    }

    pub fn get(&self, id: &str) -> Result<Agent, SupervisorError> {
        let registry = self.inner.registry.lock();
        registry
            .agents
            .get(id)
            .map(|entry| self.inner.snapshot(entry))
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// All agents, oldest first.
    pub fn list(&self) -> Vec<Agent> {
        let registry = self.inner.registry.lock();
        let mut agents: Vec<Agent> = registry
            .agents
            .values()
            .map(|entry| self.inner.snapshot(entry))
            .collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    /// The newest `lines` log entries of an agent. Zero means the default.
    pub fn logs(&self, id: &str, lines: usize) -> Result<Vec<LogEntry>, SupervisorError> {
        let lines = match lines {
            0 => DEFAULT_LOG_LINES,
            n => n,
        }
        .min(self.inner.settings.log_buffer_size);
        let registry = self.inner.registry.lock();
        let entry = registry
            .agents
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        Ok(tail(&entry.logs, lines))
    }

    pub fn meetings(&self) -> Vec<MeetingInfo> {
        let registry = self.inner.registry.lock();
        let mut meetings: Vec<MeetingInfo> = registry.meetings.values().cloned().collect();
        meetings.sort_by_key(|m| m.created_at);
        meetings
    }

    pub fn usage_stats(&self) -> UsageStats {
        let (total_agents, active_agents, total_meetings) = {
            let registry = self.inner.registry.lock();
            (
                registry.agents.len(),
                registry
                    .agents
                    .values()
                    .filter(|e| e.agent.status.is_active())
                    .count(),
                registry.meetings.len(),
            )
        };
        UsageStats {
            total_agents,
            active_agents,
            total_meetings,
            uptime_seconds: (Utc::now() - self.inner.started_at).num_seconds(),
            api_calls: self.inner.api_calls.lock().clone(),
        }
    }

    fn analyst(&self, id: &str) -> Result<Arc<Analyst>, SupervisorError> {
        let registry = self.inner.registry.lock();
        let entry = registry
            .agents
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        entry
            .analyst
            .clone()
            .ok_or_else(|| SupervisorError::NotAnalyst(id.to_string()))
    }

    pub fn analysis(&self, id: &str) -> Result<AnalysisData, SupervisorError> {
        Ok(self.analyst(id)?.snapshot())
    }

    pub fn formatted_analysis(&self, id: &str) -> Result<String, SupervisorError> {
        Ok(self.analyst(id)?.formatted())
    }

    async fn run_worker(&self, id: String, generation: u64, parts: WorkerParts) {
        let outcome = AssertUnwindSafe(self.drive(&id, generation, parts))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            let message = format!("Agent worker crashed: {}", panic_message(payload.as_ref()));
            error!(agent_id = %id, "{message}");
            self.fail(&id, generation, message).await;
        }
    }

    async fn drive(&self, id: &str, generation: u64, parts: WorkerParts) {
        let WorkerParts {
            config,
            connection,
            pipeline,
            ctx,
            cancel,
        } = parts;

        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connection.connect(notice_tx) => result,
        };
        if let Err(e) = connected {
            self.fail(id, generation, format!("Failed to start client: {e}"))
                .await;
            return;
        }
        if !self.inner.commit_running(id, generation) {
            return;
        }

        let mut utterances = pipeline.subscribe();
        let consumer = {
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let agent_id = id.to_string();
            self.inner.tracker.spawn(
                async move {
                    loop {
                        let utterance = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            utterance = utterances.recv() => utterance,
                        };
                        let Some(utterance) = utterance else { break };
                        inner
                            .hub
                            .publish(WebSocketMessage::utterance(&agent_id, &utterance));
                        inner.engine.dispatch(&cancel, Arc::clone(&ctx), utterance);
                    }
                }
                .in_current_span(),
            )
        };

        let attend = async {
            if config.auto_join {
                let joined = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = connection.join(&config.meeting_url, &config.name) => result,
                };
                match joined {
                    Ok(()) => {
                        pipeline.set_joined(true);
                        self.inner.log_run(
                            id,
                            generation,
                            LogLevel::Info,
                            format!("Joined meeting {}", config.meeting_url),
                        );
                    }
                    Err(e) => {
                        self.fail(id, generation, format!("Failed to join meeting: {e}"))
                            .await;
                        return;
                    }
                }
            }
            self.poll(id, generation, &connection, &pipeline, &cancel, notice_rx)
                .await;
        };
        attend.await;
        // The consumer stops at the cancelled token; waiting here keeps it
        // inside the worker's lifetime.
        if let Err(e) = consumer.await {
            warn!(agent_id = id, error = %e, "utterance consumer ended abnormally");
        }
        debug!("agent worker exiting");
    }

    /// Reads the live transcript on every notice or tick until cancelled.
    async fn poll(
        &self,
        id: &str,
        generation: u64,
        connection: &Arc<dyn SessionConnection>,
        pipeline: &UtterancePipeline,
        cancel: &CancellationToken,
        mut notice_rx: mpsc::Receiver<TranscriptNotice>,
    ) {
        let mut ticker = tokio::time::interval(self.inner.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut notices_open = true;
        let mut read_failing = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notice = notice_rx.recv(), if notices_open => {
                    match notice {
                        Some(notice) => trace!(uri = %notice.uri, "transcript changed"),
                        None => {
                            notices_open = false;
                            continue;
                        }
                    }
                }
                _ = ticker.tick() => {}
            }

            if connection.state() != ConnectionState::Joined {
                continue;
            }
            let segments = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connection.get_live_segments() => result,
            };
            match segments {
                Ok(segments) => {
                    if read_failing {
                        read_failing = false;
                        self.inner.log_run(
                            id,
                            generation,
                            LogLevel::Info,
                            "Live transcript reads recovered".to_string(),
                        );
                    }
                    let report = pipeline.ingest(segments);
                    if report.queued > 0 {
                        trace!(queued = report.queued, armed = report.armed, "segments queued");
                    }
                }
                // Reported once per outage, not once per poll.
                Err(e) if read_failing => debug!(error = %e, "live segment read failed"),
                Err(e) => {
                    read_failing = true;
                    self.inner.log_run(
                        id,
                        generation,
                        LogLevel::Warn,
                        format!("Failed to read live transcript: {e}"),
                    );
                }
            }
        }
    }

    /// Marks the run as failed if it is still the current one and tears the
    /// connection down.
    async fn fail(&self, id: &str, generation: u64, message: String) {
        let run = {
            let mut registry = self.inner.registry.lock();
            let Some(entry) = registry.agents.get_mut(id) else {
                return;
            };
            if entry.generation != generation || !entry.agent.status.is_active() {
                return;
            }
            entry.agent.error_message = Some(message.clone());
            self.inner.add_log(entry, LogLevel::Error, message);
            self.inner.set_status(entry, AgentStatus::Error);
            entry.run.take()
        };

        if let Some(run) = run {
            run.cancel.cancel();
            run.pipeline.close();
            self.drain_responses(id).await;
            if let Err(e) = run.connection.close().await {
                debug!(agent_id = id, error = %e, "closing failed connection");
            }
        }
    }

    /// Waits for the agent's response tasks, bounded by the stop timeout.
    async fn drain_responses(&self, id: &str) {
        let drained =
            tokio::time::timeout(self.inner.settings.stop_timeout, self.inner.engine.drain(id))
                .await;
        if drained.is_err() {
            warn!(agent_id = id, "response tasks did not finish in time");
        }
    }

    /// Cancels the run and waits for everything it spawned. The worker goes
    /// first so no new responses are dispatched while the engine drains.
    async fn teardown(&self, id: &str, run: AgentRun) {
        run.cancel.cancel();
        run.pipeline.close();
        match tokio::time::timeout(self.inner.settings.stop_timeout, run.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => warn!(agent_id = id, "agent worker panicked during stop"),
            Ok(Err(_)) => {}
            Err(_) => warn!(agent_id = id, "agent worker did not exit in time"),
        }
        self.drain_responses(id).await;
        if let Err(e) = run.connection.close().await {
            self.inner.log(
                id,
                LogLevel::Warn,
                format!("Error closing session connection: {e}"),
            );
        }
    }
}

impl Inner {
    /// Single writer of agent status. Publishes only real changes.
    fn set_status(&self, entry: &mut AgentEntry, status: AgentStatus) -> bool {
        let current = entry.agent.status;
        if current == status {
            return false;
        }
        if !current.can_transition_to(status) {
            warn!(agent_id = %entry.agent.id, from = %current, to = %status, "illegal status transition ignored");
            return false;
        }
        entry.agent.status = status;
        info!(agent_id = %entry.agent.id, %status, "agent status changed");
        self.hub
            .publish(WebSocketMessage::status(&entry.agent.id, status));
        true
    }

    fn add_log(&self, entry: &mut AgentEntry, level: LogLevel, message: String) {
        let id = &entry.agent.id;
        match level {
            LogLevel::Debug => debug!(agent_id = %id, "{message}"),
            LogLevel::Info => info!(agent_id = %id, "{message}"),
            LogLevel::Warn => warn!(agent_id = %id, "{message}"),
            LogLevel::Error => error!(agent_id = %id, "{message}"),
        }
        let log = LogEntry::new(level, message);
        self.hub.publish(WebSocketMessage::log(id, &log));
        if entry.logs.len() >= self.settings.log_buffer_size.max(1) {
            entry.logs.pop_front();
        }
        entry.logs.push_back(log);
    }

    fn log(&self, id: &str, level: LogLevel, message: String) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.agents.get_mut(id) {
            self.add_log(entry, level, message);
        }
    }

    /// Logs on behalf of one run. Dropped once the run is superseded or the
    /// agent has left `starting`, `running` and `stopping`.
    fn log_run(&self, id: &str, generation: u64, level: LogLevel, message: String) {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.agents.get_mut(id) else {
            return;
        };
        let live = entry.agent.status.is_active() || entry.agent.status == AgentStatus::Stopping;
        if entry.generation != generation || !live {
            debug!(agent_id = id, generation, "{message} (run over, not logged)");
            return;
        }
        self.add_log(entry, level, message);
    }

    fn log_sink(self: &Arc<Self>, id: &str, generation: u64) -> LogSink {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let id = id.to_string();
        Arc::new(move |level, message| {
            if let Some(inner) = inner.upgrade() {
                inner.log_run(&id, generation, level, message);
            }
        })
    }

    fn commit_running(&self, id: &str, generation: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.agents.get_mut(id) else {
            return false;
        };
        if entry.generation != generation || entry.agent.status != AgentStatus::Starting {
            return false;
        }
        self.set_status(entry, AgentStatus::Running);
        self.add_log(entry, LogLevel::Info, "Agent started successfully".to_string());
        true
    }

    fn snapshot(&self, entry: &AgentEntry) -> Agent {
        let mut agent = entry.agent.clone();
        agent.logs = tail(&entry.logs, self.settings.agent_log_tail);
        agent
    }

    fn count(&self, operation: &str) {
        *self
            .api_calls
            .lock()
            .entry(operation.to_string())
            .or_default() += 1;
    }
}

fn tail(logs: &VecDeque<LogEntry>, n: usize) -> Vec<LogEntry> {
    let skip = logs.len().saturating_sub(n);
    logs.iter().skip(skip).cloned().collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::hub::Scope;
    use crate::models::TranscriptSegment;
    use crate::testing::{FakeConnection, FakeConnectionFactory, FakeProvider, FakeProviderFactory};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        supervisor: Supervisor,
        connections: Arc<FakeConnectionFactory>,
        provider: Arc<FakeProvider>,
    }

    fn fixture_with(
        settings: SupervisorSettings,
        connections: FakeConnectionFactory,
        provider: FakeProvider,
    ) -> Fixture {
        let connections = Arc::new(connections);
        let provider = Arc::new(provider);
        let supervisor = Supervisor::new(
            settings,
            connections.clone(),
            Arc::new(FakeProviderFactory::new(provider.clone())),
        );
        Fixture {
            supervisor,
            connections,
            provider,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::default(),
            FakeProvider::new().reply("hello", "Hi Alice, good to hear you."),
        )
    }

    fn config() -> AgentConfig {
        AgentConfig::new("Ava", "https://meet.example.com/standup")
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn status_of(supervisor: &Supervisor, id: &str) -> AgentStatus {
        supervisor.get(id).unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit_leaves_existing_agents_untouched() {
        let f = fixture_with(
            SupervisorSettings {
                max_agents: 2,
                ..Default::default()
            },
            FakeConnectionFactory::default(),
            FakeProvider::new(),
        );
        let a = f.supervisor.create(config()).unwrap();
        let b = f.supervisor.create(config()).unwrap();

        let err = f.supervisor.create(config()).unwrap_err();
        assert_eq!(err, SupervisorError::Capacity(2));

        let ids: Vec<String> = f.supervisor.list().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(f.supervisor.meetings()[0].agent_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejects_bad_config() {
        let f = fixture();
        let mut bad = config();
        bad.name = "  ".into();
        assert!(matches!(
            f.supervisor.create(bad),
            Err(SupervisorError::InvalidConfig(_))
        ));

        let rejecting = Supervisor::new(
            SupervisorSettings::default(),
            Arc::new(FakeConnectionFactory::default()),
            Arc::new(FakeProviderFactory::rejecting()),
        );
        assert!(matches!(
            rejecting.create(config()),
            Err(SupervisorError::InvalidConfig(_))
        ));
        assert!(rejecting.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_ids_have_expected_shape() {
        let f = fixture();
        let agent = f.supervisor.create(config()).unwrap();
        let suffix = agent.id.strip_prefix("agent_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(agent.status, AgentStatus::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_publishes_each_status_once() {
        let f = fixture();
        let id = f.supervisor.create(config()).unwrap().id;
        let mut events = f.supervisor.hub().subscribe(Scope::Agent(id.clone())).await;

        f.supervisor.start(&id).unwrap();
        // Starting twice is a no-op.
        f.supervisor.start(&id).unwrap();
        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Running).await;
        eventually(|| {
            f.connections
                .last()
                .is_some_and(|c| c.state() == ConnectionState::Joined)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut statuses = Vec::new();
        while let Some(event) = events.try_recv() {
            if event.kind == EventKind::Status {
                statuses.push(event.data["status"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(statuses, vec!["starting", "running"]);
        assert_eq!(f.connections.created(), 1);

        let joins = f.connections.last().unwrap().joins.lock().clone();
        assert_eq!(
            joins,
            vec![("https://meet.example.com/standup".to_string(), "Ava".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_to_spoken_reply() {
        let f = fixture();
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();
        eventually(|| {
            f.connections
                .last()
                .is_some_and(|c| c.state() == ConnectionState::Joined)
        })
        .await;
        let connection = f.connections.last().unwrap();

        connection.push_segments(vec![
            TranscriptSegment::new("Alice", "hello", 0.0, 1.0),
            TranscriptSegment::new("Alice", "there", 1.2, 2.0),
        ]);
        eventually(|| !connection.spoken().is_empty()).await;
        // Further polls re-read the same window and must not trigger again.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connection.spoken(), vec!["Hi Alice, good to hear you."]);
        assert_eq!(f.provider.call_count(), 1);
        let logs = f.supervisor.logs(&id, 0).unwrap();
        assert!(logs.iter().any(|l| l.message.contains("hello there")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_pending_speech() {
        let f = fixture();
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();
        eventually(|| {
            f.connections
                .last()
                .is_some_and(|c| c.state() == ConnectionState::Joined)
        })
        .await;
        let connection = f.connections.last().unwrap();

        connection.push_segments(vec![TranscriptSegment::new("Alice", "hello", 0.0, 1.0)]);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stopped = f.supervisor.stop(&id).await.unwrap();
        assert_eq!(stopped.status, AgentStatus::Stopped);
        assert!(stopped.stopped_at.is_some());
        assert_eq!(connection.close_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(connection.spoken().is_empty());
        assert_eq!(f.provider.call_count(), 0);

        // Stopping again is harmless.
        assert_eq!(
            f.supervisor.stop(&id).await.unwrap().status,
            AgentStatus::Stopped
        );
    }

    /// Everything published for the agent after its `stopped` status.
    fn events_after_stopped(events: &[Arc<WebSocketMessage>]) -> Vec<Arc<WebSocketMessage>> {
        let stopped = events
            .iter()
            .position(|e| e.kind == EventKind::Status && e.data["status"] == "stopped")
            .expect("stopped status published");
        events[stopped + 1..].to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_reply_in_progress() {
        let f = fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::with(|| FakeConnection::new().slow_speak(Duration::from_secs(3))),
            FakeProvider::new().reply("hello", "Hi Alice."),
        );
        let id = f.supervisor.create(config()).unwrap().id;
        let mut subscription = f.supervisor.hub().subscribe(Scope::Agent(id.clone())).await;
        f.supervisor.start(&id).unwrap();
        eventually(|| {
            f.connections
                .last()
                .is_some_and(|c| c.state() == ConnectionState::Joined)
        })
        .await;
        let connection = f.connections.last().unwrap();

        connection.push_segments(vec![TranscriptSegment::new("Alice", "hello", 0.0, 1.0)]);
        connection.speak_started.notified().await;
        let stopped = f.supervisor.stop(&id).await.unwrap();
        assert_eq!(stopped.status, AgentStatus::Stopped);
        assert_eq!(connection.spoken(), vec!["Hi Alice."]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut events = Vec::new();
        while let Some(event) = subscription.try_recv() {
            events.push(event);
        }
        assert!(
            events
                .iter()
                .any(|e| e.kind == EventKind::Log
                    && e.data["message"].as_str().is_some_and(|m| m.starts_with("Responded to Alice")))
        );
        assert!(events_after_stopped(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_manual_join() {
        let f = fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::with(|| FakeConnection::new().hanging_join()),
            FakeProvider::new(),
        );
        let mut cfg = config();
        cfg.auto_join = false;
        let id = f.supervisor.create(cfg).unwrap().id;
        let mut subscription = f.supervisor.hub().subscribe(Scope::Agent(id.clone())).await;
        f.supervisor.start(&id).unwrap();
        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Running).await;

        f.supervisor.join_meeting(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.supervisor.stop(&id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut events = Vec::new();
        while let Some(event) = subscription.try_recv() {
            events.push(event);
        }
        assert!(events_after_stopped(&events).is_empty());
        let logs = f.supervisor.logs(&id, 0).unwrap();
        assert!(
            !logs
                .iter()
                .any(|l| l.message.starts_with("Joined meeting") || l.message.contains("join meeting"))
        );
        assert_eq!(logs.last().unwrap().message, "Agent stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_read_outage_is_logged_once_and_recovery_noted() {
        let f = fixture();
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();
        eventually(|| {
            f.connections
                .last()
                .is_some_and(|c| c.state() == ConnectionState::Joined)
        })
        .await;
        let connection = f.connections.last().unwrap();
        let count = |needle: &str, level: LogLevel| {
            f.supervisor
                .logs(&id, 0)
                .unwrap()
                .iter()
                .filter(|l| l.level == level && l.message.contains(needle))
                .count()
        };

        connection.set_read_failure(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count("Failed to read live transcript", LogLevel::Warn), 1);
        assert_eq!(status_of(&f.supervisor, &id), AgentStatus::Running);

        connection.set_read_failure(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count("Live transcript reads recovered", LogLevel::Info), 1);

        connection.set_read_failure(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count("Failed to read live transcript", LogLevel::Warn), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_sets_error_and_allows_restart() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let f = fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::with(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    FakeConnection::new().failing_connect("connection refused")
                } else {
                    FakeConnection::new()
                }
            }),
            FakeProvider::new(),
        );
        let id = f.supervisor.create(config()).unwrap().id;

        f.supervisor.start(&id).unwrap();
        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Error).await;
        let agent = f.supervisor.get(&id).unwrap();
        assert_eq!(
            agent.error_message.as_deref(),
            Some("Failed to start client: transport error: connection refused")
        );
        assert!(
            agent
                .logs
                .iter()
                .any(|l| l.level == LogLevel::Error && l.message.contains("connection refused"))
        );

        f.supervisor.start(&id).unwrap();
        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Running).await;
        assert!(f.supervisor.get(&id).unwrap().error_message.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_failure_is_fatal_at_startup() {
        let f = fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::with(|| FakeConnection::new().failing_join("meeting not found")),
            FakeProvider::new(),
        );
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();

        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Error).await;
        assert!(
            f.supervisor
                .get(&id)
                .unwrap()
                .error_message
                .unwrap()
                .starts_with("Failed to join meeting")
        );
        assert_eq!(f.connections.last().unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_panic_is_contained() {
        let f = fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::with(|| FakeConnection::new().panicking_connect()),
            FakeProvider::new(),
        );
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();

        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Error).await;
        let agent = f.supervisor.get(&id).unwrap();
        assert!(agent.error_message.unwrap().contains("connect exploded"));
        assert!(f.supervisor.is_running());
        assert!(f.supervisor.create(config()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_connecting() {
        let f = fixture_with(
            SupervisorSettings::default(),
            FakeConnectionFactory::with(|| FakeConnection::new().hanging_connect()),
            FakeProvider::new(),
        );
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();
        assert_eq!(status_of(&f.supervisor, &id), AgentStatus::Starting);

        let agent = f.supervisor.stop(&id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert!(agent.error_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cleans_up_meetings() {
        let f = fixture();
        let a = f.supervisor.create(config()).unwrap().id;
        let b = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&a).unwrap();
        eventually(|| status_of(&f.supervisor, &a) == AgentStatus::Running).await;

        f.supervisor.delete(&a).await.unwrap();
        assert_eq!(
            f.supervisor.get(&a).unwrap_err(),
            SupervisorError::NotFound(a.clone())
        );
        assert_eq!(f.supervisor.meetings()[0].agent_ids, vec![b.clone()]);

        f.supervisor.delete(&b).await.unwrap();
        assert!(f.supervisor.meetings().is_empty());
        assert_eq!(
            f.supervisor.delete(&b).await.unwrap_err(),
            SupervisorError::NotFound(b)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_join() {
        let f = fixture();
        let mut cfg = config();
        cfg.auto_join = false;
        let id = f.supervisor.create(cfg).unwrap().id;

        assert_eq!(
            f.supervisor.join_meeting(&id),
            Err(SupervisorError::AgentNotRunning)
        );

        f.supervisor.start(&id).unwrap();
        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Running).await;
        let connection = f.connections.last().unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);

        f.supervisor.join_meeting(&id).unwrap();
        eventually(|| connection.state() == ConnectionState::Joined).await;
        assert_eq!(
            f.supervisor.join_meeting(&id),
            Err(SupervisorError::AlreadyJoined)
        );

        connection.push_segments(vec![TranscriptSegment::new("Alice", "hello", 0.0, 1.0)]);
        eventually(|| !connection.spoken().is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_logs_query_limits() {
        let f = fixture_with(
            SupervisorSettings {
                log_buffer_size: 5,
                agent_log_tail: 2,
                ..Default::default()
            },
            FakeConnectionFactory::default(),
            FakeProvider::new(),
        );
        let id = f.supervisor.create(config()).unwrap().id;
        for i in 0..10 {
            f.supervisor.inner.log(&id, LogLevel::Info, format!("line {i}"));
        }

        let logs = f.supervisor.logs(&id, 0).unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs.last().unwrap().message, "line 9");
        assert_eq!(f.supervisor.logs(&id, 3).unwrap().len(), 3);
        assert_eq!(f.supervisor.get(&id).unwrap().logs.len(), 2);
        assert!(matches!(
            f.supervisor.logs("agent_missing", 10),
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_stats_count_operations() {
        let f = fixture();
        let id = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&id).unwrap();
        eventually(|| status_of(&f.supervisor, &id) == AgentStatus::Running).await;

        let stats = f.supervisor.usage_stats();
        assert_eq!(stats.total_agents, 1);
        assert_eq!(stats.active_agents, 1);
        assert_eq!(stats.total_meetings, 1);
        assert_eq!(stats.api_calls["create_agent"], 1);
        assert_eq!(stats.api_calls["start_agent"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_only_for_analyst_agents() {
        let f = fixture();
        let conversational = f.supervisor.create(config()).unwrap().id;
        assert_eq!(
            f.supervisor.analysis(&conversational).unwrap_err(),
            SupervisorError::NotAnalyst(conversational.clone())
        );

        let mut cfg = config();
        cfg.conversation_mode = ConversationMode::Analyst;
        let analyst = f.supervisor.create(cfg).unwrap().id;
        let data = f.supervisor.analysis(&analyst).unwrap();
        assert_eq!(data.meeting_url, "https://meet.example.com/standup");
        assert!(
            f.supervisor
                .formatted_analysis(&analyst)
                .unwrap()
                .starts_with("# Meeting Analysis Report")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let f = fixture();
        let a = f.supervisor.create(config()).unwrap().id;
        let b = f.supervisor.create(config()).unwrap().id;
        f.supervisor.start(&a).unwrap();
        f.supervisor.start(&b).unwrap();
        eventually(|| {
            status_of(&f.supervisor, &a) == AgentStatus::Running
                && status_of(&f.supervisor, &b) == AgentStatus::Running
        })
        .await;

        f.supervisor.shutdown().await;

        assert_eq!(status_of(&f.supervisor, &a), AgentStatus::Stopped);
        assert_eq!(status_of(&f.supervisor, &b), AgentStatus::Stopped);
        assert!(!f.supervisor.hub().is_running());
        assert_eq!(
            f.supervisor.create(config()).unwrap_err(),
            SupervisorError::NotRunning
        );
        assert_eq!(
            f.supervisor.start(&a).unwrap_err(),
            SupervisorError::NotRunning
        );
    }
}
