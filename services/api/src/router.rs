//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the event-stream WebSockets, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, FormattedAnalysis, HealthResponse, MessageResponse},
    state::AppState,
    ws::{self, ws_agent_handler, ws_session_handler},
};

use axum::{
    Router,
    routing::{get, post},
};
use joinly_core::{
    analyst::{ActionItem, AnalysisData, TopicDiscussion, TranscriptEntry},
    hub::HubStats,
    models::{
        Agent, AgentConfig, AgentStatus, ConversationMode, LlmProviderKind, LogEntry, LogLevel,
        MeetingInfo, SttProvider, TtsProvider, UsageStats,
    },
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::create_agent,
        handlers::list_agents,
        handlers::get_agent,
        handlers::delete_agent,
        handlers::start_agent,
        handlers::stop_agent,
        handlers::join_meeting,
        handlers::get_agent_logs,
        handlers::get_agent_analysis,
        handlers::get_formatted_analysis,
        handlers::list_meetings,
        handlers::usage_stats,
        handlers::ws_stats,
        ws::session::ws_agent_handler,
        ws::session::ws_session_handler,
    ),
    components(
        schemas(
            Agent, AgentConfig, AgentStatus, LlmProviderKind, TtsProvider, SttProvider,
            ConversationMode, LogEntry, LogLevel, MeetingInfo, UsageStats, AnalysisData,
            TranscriptEntry, ActionItem, TopicDiscussion, HubStats, ErrorResponse,
            MessageResponse, HealthResponse, FormattedAnalysis
        )
    ),
    tags(
        (name = "Joinly Manager API", description = "Lifecycle and monitoring of meeting agents")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/", get(handlers::health))
        .route(
            "/agents",
            get(handlers::list_agents).post(handlers::create_agent),
        )
        .route(
            "/agents/{id}",
            get(handlers::get_agent).delete(handlers::delete_agent),
        )
        .route("/agents/{id}/start", post(handlers::start_agent))
        .route("/agents/{id}/stop", post(handlers::stop_agent))
        .route("/agents/{id}/join-meeting", post(handlers::join_meeting))
        .route("/agents/{id}/logs", get(handlers::get_agent_logs))
        .route("/agents/{id}/analysis", get(handlers::get_agent_analysis))
        .route(
            "/agents/{id}/analysis/formatted",
            get(handlers::get_formatted_analysis),
        )
        .route("/meetings", get(handlers::list_meetings))
        .route("/usage", get(handlers::usage_stats))
        .route("/ws/stats", get(handlers::ws_stats))
        .route("/ws/agents/{id}", get(ws_agent_handler))
        .route("/ws/session", get(ws_session_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
