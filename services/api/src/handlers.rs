//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for agent management.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use joinly_core::{
    SupervisorError,
    analyst::AnalysisData,
    hub::HubStats,
    models::{Agent, AgentConfig, LogEntry, MeetingInfo, UsageStats},
};
use std::sync::Arc;
use tracing::error;

use crate::{
    models::{
        DEFAULT_HTTP_LOG_LINES, ErrorResponse, FormattedAnalysis, HealthResponse, LogsQuery,
        MessageResponse,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::ServiceUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse { message }),
            )
                .into_response(),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let message = err.to_string();
        match err {
            SupervisorError::NotFound(_) => Self::NotFound(message),
            SupervisorError::InvalidConfig(_) | SupervisorError::NotAnalyst(_) => {
                Self::BadRequest(message)
            }
            SupervisorError::Capacity(_)
            | SupervisorError::Busy(_)
            | SupervisorError::AgentNotRunning
            | SupervisorError::NotConnected
            | SupervisorError::AlreadyJoined => Self::Conflict(message),
            SupervisorError::NotRunning => Self::ServiceUnavailable(message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

/// Service health check.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.supervisor.is_running() {
        "ok"
    } else {
        "shutting_down"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Create a new meeting agent.
#[utoipa::path(
    post,
    path = "/agents",
    request_body = AgentConfig,
    responses(
        (status = 201, description = "Agent created successfully", body = Agent),
        (status = 400, description = "Invalid agent configuration", body = ErrorResponse),
        (status = 409, description = "Agent capacity reached", body = ErrorResponse),
        (status = 503, description = "Supervisor is shutting down", body = ErrorResponse)
    )
)]
pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AgentConfig>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(config) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let agent = state.supervisor.create(config)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// List all agents, oldest first.
#[utoipa::path(
    get,
    path = "/agents",
    responses(
        (status = 200, description = "List of agents", body = [Agent])
    )
)]
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<Agent>> {
    Json(state.supervisor.list())
}

/// Get a specific agent by its ID.
#[utoipa::path(
    get,
    path = "/agents/{id}",
    responses(
        (status = 200, description = "Agent details", body = Agent),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.supervisor.get(&id)?))
}

/// Stop and delete an agent.
#[utoipa::path(
    delete,
    path = "/agents/{id}",
    responses(
        (status = 200, description = "Agent deleted", body = MessageResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.supervisor.delete(&id).await?;
    Ok(Json(MessageResponse::new(format!("Agent {id} deleted"))))
}

/// Start an agent. Starting a running agent is a no-op.
#[utoipa::path(
    post,
    path = "/agents/{id}/start",
    responses(
        (status = 200, description = "Agent is starting", body = Agent),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 409, description = "Agent is stopping", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn start_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.supervisor.start(&id)?))
}

/// Stop an agent and close its meeting connection.
#[utoipa::path(
    post,
    path = "/agents/{id}/stop",
    responses(
        (status = 200, description = "Agent stopped", body = Agent),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn stop_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.supervisor.stop(&id).await?))
}

/// Ask a running agent that did not auto-join to join its meeting.
#[utoipa::path(
    post,
    path = "/agents/{id}/join-meeting",
    responses(
        (status = 202, description = "Join initiated", body = MessageResponse),
        (status = 409, description = "Agent not running, not connected or already joined", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn join_meeting(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.join_meeting(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("Join meeting initiated")),
    ))
}

/// Fetch the most recent log entries of an agent.
#[utoipa::path(
    get,
    path = "/agents/{id}/logs",
    responses(
        (status = 200, description = "Log entries, oldest first", body = [LogEntry]),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID"),
        LogsQuery
    )
)]
pub async fn get_agent_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let lines = query.lines.unwrap_or(DEFAULT_HTTP_LOG_LINES);
    Ok(Json(state.supervisor.logs(&id, lines)?))
}

/// Current meeting analysis of an analyst-mode agent.
#[utoipa::path(
    get,
    path = "/agents/{id}/analysis",
    responses(
        (status = 200, description = "Meeting analysis", body = AnalysisData),
        (status = 400, description = "Agent is not in analyst mode", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn get_agent_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisData>, ApiError> {
    Ok(Json(state.supervisor.analysis(&id)?))
}

/// Meeting analysis rendered as a markdown report.
#[utoipa::path(
    get,
    path = "/agents/{id}/analysis/formatted",
    responses(
        (status = 200, description = "Markdown report", body = FormattedAnalysis),
        (status = 400, description = "Agent is not in analyst mode", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn get_formatted_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FormattedAnalysis>, ApiError> {
    let content = state.supervisor.formatted_analysis(&id)?;
    Ok(Json(FormattedAnalysis { content }))
}

/// Meetings that currently have at least one agent.
#[utoipa::path(
    get,
    path = "/meetings",
    responses(
        (status = 200, description = "Known meetings", body = [MeetingInfo])
    )
)]
pub async fn list_meetings(State(state): State<Arc<AppState>>) -> Json<Vec<MeetingInfo>> {
    Json(state.supervisor.meetings())
}

/// Aggregate usage statistics.
#[utoipa::path(
    get,
    path = "/usage",
    responses(
        (status = 200, description = "Usage statistics", body = UsageStats)
    )
)]
pub async fn usage_stats(State(state): State<Arc<AppState>>) -> Json<UsageStats> {
    Json(state.supervisor.usage_stats())
}

/// Event stream subscriber counts.
#[utoipa::path(
    get,
    path = "/ws/stats",
    responses(
        (status = 200, description = "Subscriber counts", body = HubStats)
    )
)]
pub async fn ws_stats(State(state): State<Arc<AppState>>) -> Json<HubStats> {
    Json(state.supervisor.hub().stats())
}
