//! MCP-backed Session Connection
//!
//! Each agent run talks to the joinly meeting server over one MCP
//! streamable-HTTP session. Meeting actions are tool calls; the live
//! transcript is a subscribable resource whose update notifications are
//! relayed to the supervisor as [`TranscriptNotice`]s.

use async_trait::async_trait;
use joinly_core::connection::{
    ConnectionError, ConnectionFactory, ConnectionState, ConnectionStateCell, SessionConnection,
    TranscriptNotice,
};
use joinly_core::models::{AgentConfig, TranscriptSegment};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use rmcp::{
    ClientHandler, RoleClient, ServiceExt,
    model::{
        CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation,
        ReadResourceRequestParam, ResourceUpdatedNotificationParam, SubscribeRequestParam,
    },
    service::{NotificationContext, Peer, RunningService},
    transport::{
        StreamableHttpClientTransport, streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

/// Resource carrying the live transcript window.
pub const SEGMENTS_URI: &str = "transcript://live/segments";
/// Header the joinly server reads the session settings from.
const SETTINGS_HEADER: &str = "joinly-settings";

/// Builds one [`McpSessionConnection`] per agent start.
pub struct McpConnectionFactory {
    url: String,
    request_timeout: Duration,
}

impl McpConnectionFactory {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }
}

impl ConnectionFactory for McpConnectionFactory {
    fn create(&self, agent_id: &str, config: &AgentConfig) -> Arc<dyn SessionConnection> {
        Arc::new(McpSessionConnection::new(
            &self.url,
            self.request_timeout,
            agent_id,
            config.session_settings(),
        ))
    }
}

/// Client-side MCP handler; only transcript notifications matter to us.
#[derive(Clone)]
struct NotificationRelay {
    agent_id: String,
    notices: mpsc::Sender<TranscriptNotice>,
}

impl ClientHandler for NotificationRelay {
    fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        let notice = TranscriptNotice { uri: params.uri };
        async move {
            // A full queue already guarantees a re-read, so the notice can go.
            if self.notices.try_send(notice).is_err() {
                trace!(agent_id = %self.agent_id, "transcript notice dropped");
            }
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::from_build_env(),
        }
    }
}

pub struct McpSessionConnection {
    url: String,
    request_timeout: Duration,
    agent_id: String,
    settings: Value,
    state: ConnectionStateCell,
    peer: Mutex<Option<Peer<RoleClient>>>,
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, NotificationRelay>>>,
}

impl McpSessionConnection {
    pub fn new(url: &str, request_timeout: Duration, agent_id: &str, settings: Value) -> Self {
        Self {
            url: url.to_string(),
            request_timeout,
            agent_id: agent_id.to_string(),
            settings,
            state: ConnectionStateCell::default(),
            peer: Mutex::new(None),
            service: tokio::sync::Mutex::new(None),
        }
    }

    fn peer(&self) -> Result<Peer<RoleClient>, ConnectionError> {
        self.peer.lock().clone().ok_or(ConnectionError::NotConnected)
    }

    fn http_client(&self) -> Result<reqwest::Client, ConnectionError> {
        let mut headers = HeaderMap::new();
        let settings = HeaderValue::from_str(&self.settings.to_string())
            .map_err(|e| ConnectionError::Payload(format!("session settings: {e}")))?;
        headers.insert(SETTINGS_HEADER, settings);
        // The event stream stays open for the whole session, so only the
        // connect phase gets a timeout here.
        reqwest::Client::builder()
            .connect_timeout(self.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn open(
        &self,
        notices: mpsc::Sender<TranscriptNotice>,
    ) -> Result<RunningService<RoleClient, NotificationRelay>, ConnectionError> {
        let transport = StreamableHttpClientTransport::with_client(
            self.http_client()?,
            StreamableHttpClientTransportConfig::with_uri(self.url.clone()),
        );
        let relay = NotificationRelay {
            agent_id: self.agent_id.clone(),
            notices,
        };
        tokio::time::timeout(self.request_timeout, relay.serve(transport))
            .await
            .map_err(|_| ConnectionError::Timeout(self.request_timeout))?
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    /// Calls a tool and returns the serialized result. Results flagged as
    /// errors become [`ConnectionError::Tool`].
    async fn call_tool(&self, name: &'static str, arguments: Value) -> Result<Value, ConnectionError> {
        let peer = self.peer()?;
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        let request = peer.call_tool(CallToolRequestParam {
            name: name.into(),
            arguments,
        });
        let result = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ConnectionError::Timeout(self.request_timeout))?
            .map_err(|e| ConnectionError::Tool {
                operation: name.to_string(),
                message: e.to_string(),
            })?;
        let value =
            serde_json::to_value(&result).map_err(|e| ConnectionError::Payload(e.to_string()))?;
        if value.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ConnectionError::Tool {
                operation: name.to_string(),
                message: content_text(&value),
            });
        }
        Ok(value)
    }

    async fn subscribe_segments(&self) {
        let Ok(peer) = self.peer() else { return };
        let request = peer.subscribe(SubscribeRequestParam {
            uri: SEGMENTS_URI.to_string(),
        });
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(_)) => debug!(agent_id = %self.agent_id, "subscribed to live transcript"),
            Ok(Err(e)) => warn!(agent_id = %self.agent_id, error = %e, "transcript subscription failed, relying on polling"),
            Err(_) => warn!(agent_id = %self.agent_id, "transcript subscription timed out, relying on polling"),
        }
    }
}

/// Concatenates the text items of a tool result's `content`.
fn content_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Accepts either `{"segments": [...]}` or a bare segment array.
fn parse_segments(payload: &str) -> Result<Vec<TranscriptSegment>, ConnectionError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ConnectionError::Payload(e.to_string()))?;
    let segments = match value {
        Value::Object(mut map) => map.remove("segments").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(segments).map_err(|e| ConnectionError::Payload(e.to_string()))
}

#[async_trait]
impl SessionConnection for McpSessionConnection {
    #[instrument(skip_all, fields(agent_id = %self.agent_id, url = %self.url))]
    async fn connect(&self, notices: mpsc::Sender<TranscriptNotice>) -> Result<(), ConnectionError> {
        self.state.transition(ConnectionState::Connecting)?;
        let service = match self.open(notices).await {
            Ok(service) => service,
            Err(e) => {
                self.state.reset();
                return Err(e);
            }
        };
        *self.peer.lock() = Some(service.peer().clone());
        *self.service.lock().await = Some(service);
        self.state.transition(ConnectionState::Connected)?;
        info!("connected to joinly server");

        self.subscribe_segments().await;
        Ok(())
    }

    async fn join(&self, meeting_url: &str, participant_name: &str) -> Result<(), ConnectionError> {
        match self.state.get() {
            ConnectionState::Joined => return Err(ConnectionError::AlreadyJoined),
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(ConnectionError::NotConnected);
            }
        }
        self.call_tool(
            "join_meeting",
            json!({ "meeting_url": meeting_url, "participant_name": participant_name }),
        )
        .await?;
        self.state.transition(ConnectionState::Joined)?;
        info!(agent_id = %self.agent_id, meeting_url, "joined meeting");
        Ok(())
    }

    async fn leave(&self) -> Result<(), ConnectionError> {
        if self.state.get() != ConnectionState::Joined {
            return Err(ConnectionError::NotJoined);
        }
        self.call_tool("leave_meeting", json!({})).await?;
        self.state.transition(ConnectionState::Connected)?;
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), ConnectionError> {
        if self.state.get() != ConnectionState::Joined {
            return Err(ConnectionError::NotJoined);
        }
        self.call_tool("speak_text", json!({ "text": text })).await?;
        Ok(())
    }

    async fn get_transcript(&self) -> Result<Value, ConnectionError> {
        let result = self.call_tool("get_transcript", json!({})).await?;
        let text = content_text(&result);
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn get_live_segments(&self) -> Result<Vec<TranscriptSegment>, ConnectionError> {
        let peer = self.peer()?;
        let request = peer.read_resource(ReadResourceRequestParam {
            uri: SEGMENTS_URI.to_string(),
        });
        let result = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ConnectionError::Timeout(self.request_timeout))?
            .map_err(|e| ConnectionError::Tool {
                operation: "read_resource".to_string(),
                message: e.to_string(),
            })?;
        let value =
            serde_json::to_value(&result).map_err(|e| ConnectionError::Payload(e.to_string()))?;
        match value
            .get("contents")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
        {
            Some(text) => parse_segments(text),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip_all, fields(agent_id = %self.agent_id))]
    async fn close(&self) -> Result<(), ConnectionError> {
        if self.state.get() == ConnectionState::Joined {
            if let Err(e) = self.leave().await {
                debug!(error = %e, "leave before close failed");
            }
        }
        self.peer.lock().take();
        let service = self.service.lock().await.take();
        self.state.reset();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| ConnectionError::Transport(e.to_string()))?;
            info!("disconnected from joinly server");
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}
