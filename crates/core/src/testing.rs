//! In-memory collaborators shared by the core's unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

use crate::connection::{
    ConnectionError, ConnectionFactory, ConnectionState, ConnectionStateCell, SessionConnection,
    TranscriptNotice,
};
use crate::llm::{LlmError, LlmProvider, ProviderFactory, ResponseSchema};
use crate::models::{AgentConfig, LlmProviderKind, TranscriptSegment};

/// Scripted session connection that records everything it is asked to do.
#[derive(Default)]
pub struct FakeConnection {
    state: ConnectionStateCell,
    segments: Mutex<Vec<TranscriptSegment>>,
    notices: Mutex<Option<mpsc::Sender<TranscriptNotice>>>,
    pub spoken: Mutex<Vec<String>>,
    pub joins: Mutex<Vec<(String, String)>>,
    pub closes: AtomicUsize,
    fail_connect: Option<String>,
    fail_join: Option<String>,
    fail_speak: AtomicBool,
    fail_reads: AtomicBool,
    speak_delay: Option<Duration>,
    pub speak_started: Notify,
    panic_on_connect: bool,
    hang_on_connect: bool,
    hang_on_join: bool,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_connect(mut self, message: &str) -> Self {
        self.fail_connect = Some(message.to_string());
        self
    }

    pub fn failing_join(mut self, message: &str) -> Self {
        self.fail_join = Some(message.to_string());
        self
    }

    pub fn panicking_connect(mut self) -> Self {
        self.panic_on_connect = true;
        self
    }

    pub fn hanging_connect(mut self) -> Self {
        self.hang_on_connect = true;
        self
    }

    pub fn hanging_join(mut self) -> Self {
        self.hang_on_join = true;
        self
    }

    /// Every speak call takes `delay` before it is recorded.
    pub fn slow_speak(mut self, delay: Duration) -> Self {
        self.speak_delay = Some(delay);
        self
    }

    pub fn set_read_failure(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_speak_failure(&self, fail: bool) {
        self.fail_speak.store(fail, Ordering::SeqCst);
    }

    /// Replaces the live segment window and pushes a change notice.
    pub fn push_segments(&self, segments: Vec<TranscriptSegment>) {
        *self.segments.lock() = segments;
        if let Some(tx) = self.notices.lock().as_ref() {
            let _ = tx.try_send(TranscriptNotice {
                uri: "transcript://live/segments".to_string(),
            });
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnection for FakeConnection {
    async fn connect(&self, notices: mpsc::Sender<TranscriptNotice>) -> Result<(), ConnectionError> {
        if self.panic_on_connect {
            panic!("connect exploded");
        }
        if self.hang_on_connect {
            std::future::pending::<()>().await;
        }
        self.state.transition(ConnectionState::Connecting)?;
        if let Some(message) = &self.fail_connect {
            self.state.reset();
            return Err(ConnectionError::Transport(message.clone()));
        }
        self.state.transition(ConnectionState::Connected)?;
        *self.notices.lock() = Some(notices);
        Ok(())
    }

    async fn join(&self, meeting_url: &str, participant_name: &str) -> Result<(), ConnectionError> {
        match self.state.get() {
            ConnectionState::Joined => return Err(ConnectionError::AlreadyJoined),
            ConnectionState::Connected => {}
            _ => return Err(ConnectionError::NotConnected),
        }
        if self.hang_on_join {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.fail_join {
            return Err(ConnectionError::Tool {
                operation: "join_meeting".to_string(),
                message: message.clone(),
            });
        }
        self.state.transition(ConnectionState::Joined)?;
        self.joins
            .lock()
            .push((meeting_url.to_string(), participant_name.to_string()));
        Ok(())
    }

    async fn leave(&self) -> Result<(), ConnectionError> {
        if self.state.get() != ConnectionState::Joined {
            return Err(ConnectionError::NotJoined);
        }
        self.state.transition(ConnectionState::Connected)?;
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), ConnectionError> {
        self.speak_started.notify_one();
        if let Some(delay) = self.speak_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_speak.load(Ordering::SeqCst) {
            return Err(ConnectionError::Tool {
                operation: "speak_text".to_string(),
                message: "tts backend unavailable".to_string(),
            });
        }
        self.spoken.lock().push(text.to_string());
        Ok(())
    }

    async fn get_transcript(&self) -> Result<Value, ConnectionError> {
        Ok(json!({ "segments": *self.segments.lock() }))
    }

    async fn get_live_segments(&self) -> Result<Vec<TranscriptSegment>, ConnectionError> {
        if self.state.get() != ConnectionState::Joined {
            return Err(ConnectionError::NotJoined);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ConnectionError::Timeout(Duration::from_secs(60)));
        }
        Ok(self.segments.lock().clone())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.notices.lock().take();
        self.state.reset();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

type ConnectionBuilder = Box<dyn Fn() -> FakeConnection + Send + Sync>;

/// Hands out [`FakeConnection`]s and keeps them for inspection.
pub struct FakeConnectionFactory {
    build: ConnectionBuilder,
    created: Mutex<Vec<Arc<FakeConnection>>>,
}

impl Default for FakeConnectionFactory {
    fn default() -> Self {
        Self::with(FakeConnection::new)
    }
}

impl FakeConnectionFactory {
    pub fn with(build: impl Fn() -> FakeConnection + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

impl ConnectionFactory for FakeConnectionFactory {
    fn create(&self, _agent_id: &str, _config: &AgentConfig) -> Arc<dyn SessionConnection> {
        let connection = Arc::new((self.build)());
        self.created.lock().push(Arc::clone(&connection));
        connection
    }
}

/// Provider that answers by matching a trigger against the prompt. Rules are
/// checked in order; a rule without a reply never answers.
#[derive(Default)]
pub struct FakeProvider {
    rules: Vec<(String, Option<String>)>,
    unavailable: bool,
    failing: bool,
    pub calls: AtomicUsize,
    pub entered: Notify,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, trigger: &str, reply: &str) -> Self {
        self.rules.push((
            trigger.to_string(),
            Some(json!({ "assistant_reply": reply, "metadata": {} }).to_string()),
        ));
        self
    }

    pub fn hang(mut self, trigger: &str) -> Self {
        self.rules.push((trigger.to_string(), None));
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for FakeProvider {
    async fn call(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if self.failing {
            return Err(LlmError::Request("upstream 500".to_string()));
        }
        let rule = self.rules.iter().find(|(trigger, _)| prompt.contains(trigger.as_str()));
        match rule {
            Some((_, Some(reply))) => Ok(reply.clone()),
            Some((_, None)) => std::future::pending().await,
            None => Ok(json!({ "assistant_reply": "ok" }).to_string()),
        }
    }

    async fn call_with_schema(
        &self,
        prompt: &str,
        _schema: &ResponseSchema,
    ) -> Result<String, LlmError> {
        self.call(prompt).await
    }

    fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Resolves every provider kind to the same instance.
pub struct FakeProviderFactory {
    provider: Arc<dyn LlmProvider>,
    reject: bool,
}

impl FakeProviderFactory {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            reject: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            provider: Arc::new(FakeProvider::new()),
            reject: true,
        }
    }
}

impl ProviderFactory for FakeProviderFactory {
    fn provider_for(
        &self,
        kind: LlmProviderKind,
        _model: &str,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        if self.reject {
            return Err(LlmError::Request(format!(
                "failed to create {} client",
                kind.as_str()
            )));
        }
        Ok(Arc::clone(&self.provider))
    }
}
